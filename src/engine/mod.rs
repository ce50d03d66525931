mod conflict;
mod error;
mod lifecycle;
mod queries;
mod settings;

pub use conflict::{overlaps, validate_booking_conflict, OCCUPANCY_THRESHOLD};
pub use error::EngineError;
pub use lifecycle::{BookingPatch, NewBooking};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedBayState = Arc<RwLock<BayState>>;

/// Attempts at locking a booking's bay before giving up on a booking that keeps moving.
const RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on waiting for a bay lock inside a mutation.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL and batches appends: take the first append, drain whatever else
/// is already queued, then fsync once and answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, events = batch.len(), "WAL commit failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes never leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedBayState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → bay id.
    pub(super) booking_to_bay: DashMap<Ulid, Ulid>,
    /// Bay key → bay id. Keys are unique.
    pub(super) bay_keys: DashMap<String, Ulid>,
    /// Serializes bay creation and deletion so key checks and inserts stay atomic.
    pub(super) bay_admin: Mutex<()>,
    pub(super) next_number: AtomicU64,
    /// Last chat delivery settings written through the engine, if any.
    pub(super) notify_settings: RwLock<Option<NotifySettings>>,
    pub(super) config: EngineConfig,
}

/// Apply an event to one bay (no locking; caller holds the lock).
///
/// A `BookingUpdated` that moves a booking is applied to both bays: the old one
/// drops it, the new one inserts it.
fn apply_to_bay(rs: &mut BayState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BayUpdated { name, at, .. } => {
            rs.name = name.clone();
            rs.updated_at = *at;
        }
        Event::BookingCreated { booking } => {
            index.insert(booking.id, rs.id);
            rs.insert_booking(booking.clone());
        }
        Event::BookingUpdated { booking, .. } => {
            rs.remove_booking(booking.id);
            if booking.bay_id == rs.id {
                index.insert(booking.id, rs.id);
                rs.insert_booking(booking.clone());
            }
        }
        Event::BookingClosed { id, end, at, .. } => {
            finish_booking(rs, *id, BookingStatus::Closed, *end, *at);
        }
        Event::BookingCanceled { id, end, at, .. } => {
            finish_booking(rs, *id, BookingStatus::Canceled, *end, *at);
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            index.remove(id);
        }
        // These live at the engine level.
        Event::BayCreated { .. }
        | Event::BayDeleted { .. }
        | Event::NumberSeries { .. }
        | Event::NotifySettingsSet { .. } => {}
    }
}

fn finish_booking(rs: &mut BayState, id: Ulid, status: BookingStatus, end: Ms, at: Ms) {
    if let Some(b) = rs.booking_mut(id) {
        b.status = status;
        b.end = Some(end);
        b.updated_at = at;
    }
}

/// Bays an event touches, in application order.
fn event_bays(event: &Event) -> Vec<Ulid> {
    match event {
        Event::BayUpdated { id, .. } => vec![*id],
        Event::BookingCreated { booking } => vec![booking.bay_id],
        Event::BookingUpdated { previous_bay, booking } if *previous_bay != booking.bay_id => {
            vec![*previous_bay, booking.bay_id]
        }
        Event::BookingUpdated { booking, .. } => vec![booking.bay_id],
        Event::BookingClosed { bay_id, .. }
        | Event::BookingCanceled { bay_id, .. }
        | Event::BookingDeleted { bay_id, .. } => vec![*bay_id],
        Event::BayCreated { .. }
        | Event::BayDeleted { .. }
        | Event::NumberSeries { .. }
        | Event::NotifySettingsSet { .. } => vec![],
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_config(wal_path, notify, EngineConfig::default())
    }

    pub fn with_config(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_bay: DashMap::new(),
            bay_keys: DashMap::new(),
            bay_admin: Mutex::new(()),
            next_number: AtomicU64::new(1),
            notify_settings: RwLock::new(None),
            config,
        };

        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            events = events.len(),
            bays = engine.state.len(),
            bookings = engine.booking_to_bay.len(),
            "replayed WAL"
        );

        Ok(engine)
    }

    /// Replay runs before the engine is shared, so every `try_write` succeeds.
    /// Never block here: this may run inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::BayCreated { id, key, name, at } => {
                let rs = BayState::new(*id, key.clone(), name.clone(), *at);
                self.state.insert(*id, Arc::new(RwLock::new(rs)));
                self.bay_keys.insert(key.clone(), *id);
            }
            Event::BayDeleted { id } => {
                if let Some((_, rs)) = self.state.remove(id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.bay_keys.remove(&guard.key);
                    for b in &guard.bookings {
                        self.booking_to_bay.remove(&b.id);
                    }
                }
            }
            Event::NumberSeries { next } => {
                self.next_number.fetch_max(*next, Ordering::Relaxed);
            }
            Event::NotifySettingsSet { settings } => match self.notify_settings.try_write() {
                Ok(mut current) => *current = Some(settings.clone()),
                Err(_) => tracing::warn!("replay: notify settings contended, event skipped"),
            },
            other => {
                if let Event::BookingCreated { booking } = other {
                    self.next_number.fetch_max(booking.number + 1, Ordering::Relaxed);
                }
                for bay_id in event_bays(other) {
                    if let Some(entry) = self.state.get(&bay_id) {
                        let rs = entry.value().clone();
                        drop(entry);
                        match rs.try_write() {
                            Ok(mut guard) => apply_to_bay(&mut guard, other, &self.booking_to_bay),
                            Err(_) => tracing::warn!(%bay_id, "replay: bay state contended, event skipped"),
                        }
                    }
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_bay_state(&self, id: &Ulid) -> Option<SharedBayState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn bay_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_bay.get(booking_id).map(|e| *e.value())
    }

    /// Id of the waiting-list sentinel bay, if one exists.
    pub fn waiting_list_bay(&self) -> Option<Ulid> {
        self.bay_keys.get(WAITING_LIST_KEY).map(|e| *e.value())
    }

    /// WAL-append, apply to every bay the event touches, then broadcast.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut [OwnedRwLockWriteGuard<BayState>],
        event: &Event,
        realtime: RealtimeEvent,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for bay_id in event_bays(event) {
            if let Some(guard) = guards.iter_mut().find(|g| g.id == bay_id) {
                apply_to_bay(guard, event, &self.booking_to_bay);
            }
        }
        self.notify.publish(realtime);
        Ok(())
    }

    /// Acquire a bay's write lock within the configured deadline.
    ///
    /// Fails with `NotFound` if the bay was deleted while we waited.
    pub(super) async fn lock_bay(
        &self,
        bay_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<BayState>, EngineError> {
        let rs = self.get_bay_state(&bay_id).ok_or(EngineError::NotFound(bay_id))?;
        let guard = tokio::time::timeout(self.config.lock_timeout, rs.clone().write_owned())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::Timeout
            })?;
        let still_current = self
            .state
            .get(&bay_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &rs));
        if !still_current {
            return Err(EngineError::NotFound(bay_id));
        }
        Ok(guard)
    }

    /// Lock several bays in ascending id order so concurrent movers never deadlock.
    pub(super) async fn lock_bays(
        &self,
        bay_ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<BayState>>, EngineError> {
        let mut ids = bay_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_bay(id).await?);
        }
        Ok(guards)
    }

    /// Lookup booking → bay, lock the bay, and confirm the booking is still there.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<BayState>, EngineError> {
        for _ in 0..RESOLVE_ATTEMPTS {
            let bay_id = self
                .bay_for_booking(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            let guard = self.lock_bay(bay_id).await?;
            if guard.booking(booking_id).is_some() {
                return Ok(guard);
            }
            // Moved to another bay between lookup and lock.
        }
        Err(EngineError::NotFound(booking_id))
    }

    pub(super) fn take_number(&self) -> u64 {
        self.next_number.fetch_add(1, Ordering::Relaxed)
    }

    /// Rewrite the WAL with the minimal event set that recreates the current state.
    ///
    /// Every bay stays read-locked until the swap completes so no commit can land
    /// between the snapshot and the rewrite. Locks are taken in the same order
    /// mutations use: the bay-admin mutex first, then bays by ascending id.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.bay_admin.lock().await;
        let mut bay_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        bay_ids.sort();
        let mut guards = Vec::with_capacity(bay_ids.len());
        for id in bay_ids {
            if let Some(rs) = self.get_bay_state(&id) {
                guards.push(rs.read_owned().await);
            }
        }
        let settings = self.notify_settings.read().await;

        let mut events = vec![Event::NumberSeries {
            next: self.next_number.load(Ordering::Relaxed),
        }];
        if let Some(settings) = settings.as_ref() {
            events.push(Event::NotifySettingsSet {
                settings: settings.clone(),
            });
        }
        for guard in &guards {
            events.push(Event::BayCreated {
                id: guard.id,
                key: guard.key.clone(),
                name: guard.name.clone(),
                at: guard.created_at,
            });
            if guard.updated_at != guard.created_at {
                events.push(Event::BayUpdated {
                    id: guard.id,
                    name: guard.name.clone(),
                    at: guard.updated_at,
                });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(settings);
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
