use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::RealtimeEvent;

pub const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of booking and bay events to live listeners.
///
/// Publishing never blocks. Each channel is a bounded ring: a listener that
/// falls behind loses the oldest events and learns how many on its next receive.
pub struct NotifyHub {
    all: broadcast::Sender<RealtimeEvent>,
    bays: DashMap<Ulid, broadcast::Sender<RealtimeEvent>>,
    capacity: usize,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            all: broadcast::channel(capacity).0,
            bays: DashMap::new(),
            capacity,
        }
    }

    /// Every event for every bay.
    pub fn subscribe_all(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.all.subscribe()
    }

    /// Events for one bay. Creates the channel if needed.
    pub fn subscribe(&self, bay_id: Ulid) -> broadcast::Receiver<RealtimeEvent> {
        let sender = self
            .bays
            .entry(bay_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        sender.subscribe()
    }

    /// Send to the global feed and the event's bay (and the bay a moved booking
    /// left). No-op without listeners.
    pub fn publish(&self, event: RealtimeEvent) {
        for bay_id in std::iter::once(event.bay_id).chain(event.moved_from) {
            if let Some(sender) = self.bays.get(&bay_id) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.all.send(event);
    }

    /// Drop a bay's channel once the bay is gone.
    pub fn remove(&self, bay_id: &Ulid) {
        self.bays.remove(bay_id);
    }
}
