use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the engine is one of these.
pub type Ms = i64;

/// Key of the sentinel bay that holds unscheduled work.
pub const WAITING_LIST_KEY: &str = "WaitingList";

/// Half-open interval `[start, end)`. `end == None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Option<Ms>,
}

impl Span {
    pub fn new(start: Ms, end: Option<Ms>) -> Self {
        Self { start, end }
    }

    pub fn bounded(start: Ms, end: Ms) -> Self {
        Self { start, end: Some(end) }
    }

    pub fn open(start: Ms) -> Self {
        Self { start, end: None }
    }

    pub fn is_well_formed(&self) -> bool {
        self.end.is_none_or(|e| e >= self.start)
    }

    /// Symmetric. Touching boundaries do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        other.end.is_none_or(|e| self.start < e) && self.end.is_none_or(|e| other.start < e)
    }

    /// Agenda inclusion: starts before `to` and has not ended before `from`.
    pub fn touches_window(&self, from: Ms, to: Ms) -> bool {
        self.start < to && self.end.is_none_or(|e| e >= from)
    }

    /// Occupancy inclusion. Both ends inclusive.
    pub fn occupied_at(&self, at: Ms) -> bool {
        self.start <= at && self.end.is_none_or(|e| e >= at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Open,
    InProgress,
    Closed,
    Canceled,
}

impl BookingStatus {
    /// Open and in-progress bookings hold their bay.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Open | BookingStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Open => "open",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Closed => "closed",
            BookingStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(BookingStatus::Open),
            "in_progress" => Some(BookingStatus::InProgress),
            "closed" => Some(BookingStatus::Closed),
            "canceled" => Some(BookingStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reservation of one bay for one vehicle.
///
/// Vehicle, company and technician ids reference records owned by other
/// services, so they are kept as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub number: u64,
    pub bay_id: Ulid,
    pub vehicle_id: String,
    pub company_id: Option<String>,
    pub technician_ids: Vec<String>,
    pub start: Ms,
    pub end: Option<Ms>,
    pub status: BookingStatus,
    pub title: String,
    pub complaint: String,
    pub description: String,
    pub notes: String,
    pub service_ref: String,
    pub created_by: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Six-digit public number, e.g. `000042`.
    pub fn display_number(&self) -> String {
        format!("{:06}", self.number)
    }
}

/// Bay as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bay {
    pub id: Ulid,
    pub key: String,
    pub name: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Bay {
    pub fn is_waiting_list(&self) -> bool {
        self.key == WAITING_LIST_KEY
    }
}

/// In-memory state of one bay: its metadata plus every booking on it.
#[derive(Debug, Clone)]
pub struct BayState {
    pub id: Ulid,
    pub key: String,
    pub name: String,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// All bookings regardless of status, sorted by `start`.
    pub bookings: Vec<Booking>,
}

impl BayState {
    pub fn new(id: Ulid, key: String, name: String, at: Ms) -> Self {
        Self {
            id,
            key,
            name,
            created_at: at,
            updated_at: at,
            bookings: Vec::new(),
        }
    }

    pub fn is_waiting_list(&self) -> bool {
        self.key == WAITING_LIST_KEY
    }

    pub fn info(&self) -> Bay {
        Bay {
            id: self.id,
            key: self.key.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Insert keeping sort order by start. Equal starts keep insertion order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self.bookings.partition_point(|b| b.start <= booking.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.is_active())
    }

    pub fn has_active(&self) -> bool {
        self.active().next().is_some()
    }
}

/// The WAL record format. Flat and self-contained so replay needs no lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BayCreated {
        id: Ulid,
        key: String,
        name: String,
        at: Ms,
    },
    BayUpdated {
        id: Ulid,
        name: String,
        at: Ms,
    },
    BayDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full replacement. `previous_bay` differs from `booking.bay_id` on a move.
    BookingUpdated {
        previous_bay: Ulid,
        booking: Booking,
    },
    BookingClosed {
        id: Ulid,
        bay_id: Ulid,
        end: Ms,
        at: Ms,
    },
    BookingCanceled {
        id: Ulid,
        bay_id: Ulid,
        end: Ms,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        bay_id: Ulid,
    },
    /// Written by compaction so numbers of deleted bookings are never reissued.
    NumberSeries {
        next: u64,
    },
    NotifySettingsSet {
        settings: NotifySettings,
    },
}

/// Chat delivery settings changed at runtime. Empty token or chat id means
/// messages go to the log instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySettings {
    pub token: String,
    pub chat_id: String,
    /// `None` selects the built-in layout.
    pub template: Option<String>,
    /// Bumped on every change.
    pub revision: u64,
    pub updated_at: Ms,
}

// ── Broadcast events ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "booking.created")]
    BookingCreated,
    #[serde(rename = "booking.updated")]
    BookingUpdated,
    #[serde(rename = "booking.canceled")]
    BookingCanceled,
    #[serde(rename = "booking.closed")]
    BookingClosed,
    #[serde(rename = "booking.deleted")]
    BookingDeleted,
    #[serde(rename = "bay.created")]
    BayCreated,
    #[serde(rename = "bay.updated")]
    BayUpdated,
    #[serde(rename = "bay.deleted")]
    BayDeleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BookingCreated => "booking.created",
            EventKind::BookingUpdated => "booking.updated",
            EventKind::BookingCanceled => "booking.canceled",
            EventKind::BookingClosed => "booking.closed",
            EventKind::BookingDeleted => "booking.deleted",
            EventKind::BayCreated => "bay.created",
            EventKind::BayUpdated => "bay.updated",
            EventKind::BayDeleted => "bay.deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    Booking(Booking),
    Bay(Bay),
    Deleted { id: Ulid },
}

/// What listeners receive: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: EventData,
    /// Bay the event belongs to, used for per-bay fan-out.
    #[serde(skip)]
    pub bay_id: Ulid,
    /// Time range before an update, so subscribers can tell a reschedule.
    #[serde(skip)]
    pub previous: Option<Span>,
    /// Bay a moved booking left; its listeners hear about the move too.
    #[serde(skip)]
    pub moved_from: Option<Ulid>,
}

impl RealtimeEvent {
    pub fn booking(kind: EventKind, booking: Booking) -> Self {
        Self {
            kind,
            bay_id: booking.bay_id,
            data: EventData::Booking(booking),
            previous: None,
            moved_from: None,
        }
    }

    pub fn booking_deleted(id: Ulid, bay_id: Ulid) -> Self {
        Self {
            kind: EventKind::BookingDeleted,
            bay_id,
            data: EventData::Deleted { id },
            previous: None,
            moved_from: None,
        }
    }

    pub fn bay(kind: EventKind, bay: Bay) -> Self {
        Self {
            kind,
            bay_id: bay.id,
            data: EventData::Bay(bay),
            previous: None,
            moved_from: None,
        }
    }

    pub fn with_previous(mut self, span: Span) -> Self {
        self.previous = Some(span);
        self
    }

    pub fn moved_from(mut self, bay_id: Ulid) -> Self {
        if bay_id != self.bay_id {
            self.moved_from = Some(bay_id);
        }
        self
    }

    pub fn as_booking(&self) -> Option<&Booking> {
        match &self.data {
            EventData::Booking(b) => Some(b),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Occupancy of one bay at an instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BayOccupancy {
    pub bay: Bay,
    pub booking: Option<Booking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankEntry {
    pub id: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub open: u64,
    pub starting_in_range: u64,
    pub bays: u64,
    pub top_technicians: Vec<RankEntry>,
    pub top_vehicles: Vec<RankEntry>,
    pub top_companies: Vec<RankEntry>,
    pub top_bays: Vec<RankEntry>,
}

/// Filters for `list_bookings`. `None` means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub bay_id: Option<Ulid>,
    pub vehicle_id: Option<String>,
    pub company_id: Option<String>,
    pub technician_id: Option<String>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.bay_id.is_none_or(|id| b.bay_id == id)
            && self.vehicle_id.as_ref().is_none_or(|v| &b.vehicle_id == v)
            && self
                .company_id
                .as_ref()
                .is_none_or(|c| b.company_id.as_ref() == Some(c))
            && self
                .technician_id
                .as_ref()
                .is_none_or(|t| b.technician_ids.contains(t))
            && self.status.is_none_or(|s| b.status == s)
    }
}
