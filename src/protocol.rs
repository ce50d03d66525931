//! Line-delimited JSON request and response shapes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::auth::Permission;
use crate::engine::{BookingPatch, EngineError, NewBooking};
use crate::model::{BookingFilter, BookingStatus, Ms};
use crate::timefmt::parse_instant;

#[derive(Debug)]
pub enum ProtocolError {
    BadRequest(String),
    Unauthenticated,
    Forbidden(&'static str),
    Engine(EngineError),
    Internal(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::BadRequest(_) => "invalid_input",
            ProtocolError::Unauthenticated => "unauthenticated",
            ProtocolError::Forbidden(_) => "forbidden",
            ProtocolError::Engine(e) => e.code(),
            ProtocolError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            ProtocolError::Unauthenticated => write!(f, "authenticate first"),
            ProtocolError::Forbidden(op) => write!(f, "role may not {op}"),
            ProtocolError::Engine(e) => write!(f, "{e}"),
            ProtocolError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<EngineError> for ProtocolError {
    fn from(e: EngineError) -> Self {
        ProtocolError::Engine(e)
    }
}

/// An instant as Unix milliseconds or text accepted by [`parse_instant`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Instant {
    Millis(Ms),
    Text(String),
}

impl Instant {
    pub fn resolve(&self, field: &str) -> Result<Ms, ProtocolError> {
        match self {
            Instant::Millis(ms) => Ok(*ms),
            Instant::Text(s) => parse_instant(s)
                .ok_or_else(|| ProtocolError::BadRequest(format!("{field}: unrecognized time {s:?}"))),
        }
    }
}

fn resolve_opt(value: &Option<Instant>, field: &str) -> Result<Option<Ms>, ProtocolError> {
    value.as_ref().map(|v| v.resolve(field)).transpose()
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn nullable<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Some)
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingInput {
    /// Omitted bookings go to the waiting list.
    #[serde(default)]
    pub bay_id: Option<Ulid>,
    pub vehicle_id: String,
    #[serde(default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub technician_ids: Vec<String>,
    pub start: Instant,
    #[serde(default)]
    pub end: Option<Instant>,
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub complaint: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub service_ref: String,
}

impl BookingInput {
    pub fn into_new_booking(
        self,
        bay_id: Ulid,
        created_by: Option<String>,
    ) -> Result<NewBooking, ProtocolError> {
        Ok(NewBooking {
            bay_id,
            start: self.start.resolve("start")?,
            end: resolve_opt(&self.end, "end")?,
            vehicle_id: self.vehicle_id,
            company_id: self.company_id,
            technician_ids: self.technician_ids,
            status: self.status,
            title: self.title,
            complaint: self.complaint,
            description: self.description,
            notes: self.notes,
            service_ref: self.service_ref,
            created_by,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchInput {
    pub id: Ulid,
    #[serde(default)]
    pub bay_id: Option<Ulid>,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub company_id: Option<Option<String>>,
    #[serde(default)]
    pub technician_ids: Option<Vec<String>>,
    #[serde(default)]
    pub start: Option<Instant>,
    #[serde(default, deserialize_with = "nullable")]
    pub end: Option<Option<Instant>>,
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub complaint: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub service_ref: Option<String>,
}

impl PatchInput {
    pub fn into_patch(self) -> Result<(Ulid, BookingPatch), ProtocolError> {
        let end = match &self.end {
            None => None,
            Some(v) => Some(resolve_opt(v, "end")?),
        };
        let patch = BookingPatch {
            bay_id: self.bay_id,
            vehicle_id: self.vehicle_id,
            company_id: self.company_id,
            technician_ids: self.technician_ids,
            start: resolve_opt(&self.start, "start")?,
            end,
            status: self.status,
            title: self.title,
            complaint: self.complaint,
            description: self.description,
            notes: self.notes,
            service_ref: self.service_ref,
        };
        Ok((self.id, patch))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterInput {
    pub bay_id: Option<Ulid>,
    pub vehicle_id: Option<String>,
    pub company_id: Option<String>,
    pub technician_id: Option<String>,
    pub status: Option<BookingStatus>,
}

impl From<FilterInput> for BookingFilter {
    fn from(f: FilterInput) -> Self {
        BookingFilter {
            bay_id: f.bay_id,
            vehicle_id: f.vehicle_id,
            company_id: f.company_id,
            technician_id: f.technician_id,
            status: f.status,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Auth { token: String },
    CreateBay { key: String, name: String },
    UpdateBay { id: Ulid, name: String },
    DeleteBay { id: Ulid },
    ListBays,
    CreateBooking(BookingInput),
    UpdateBooking(PatchInput),
    CloseBooking { id: Ulid },
    CancelBooking { id: Ulid },
    DeleteBooking { id: Ulid },
    GetBooking { id: Ulid },
    ListBookings(FilterInput),
    ExportBookings(FilterInput),
    Agenda { from: Instant, to: Instant },
    Occupancy { at: Option<Instant> },
    Ready { from: Instant, to: Instant },
    WaitingList { from: Option<Instant>, to: Option<Instant> },
    Summary { from: Instant, to: Instant },
    /// Subscribe to one bay, or to every bay when `bay_id` is omitted.
    Listen { bay_id: Option<Ulid> },
    Unlisten { bay_id: Option<Ulid> },
    GetNotifySettings,
    SetNotifySettings {
        #[serde(default)]
        token: String,
        #[serde(default)]
        chat_id: String,
        #[serde(default)]
        template: Option<String>,
    },
}

impl Request {
    /// `None` for `auth`, which is allowed before a role is known.
    pub fn permission(&self) -> Option<Permission> {
        match self {
            Request::Auth { .. } => None,
            Request::CloseBooking { .. } => Some(Permission::Close),
            Request::CreateBay { .. }
            | Request::UpdateBay { .. }
            | Request::CreateBooking(_)
            | Request::UpdateBooking(_)
            | Request::CancelBooking { .. } => Some(Permission::Schedule),
            Request::DeleteBay { .. } | Request::DeleteBooking { .. } => Some(Permission::Delete),
            Request::GetNotifySettings | Request::SetNotifySettings { .. } => {
                Some(Permission::Configure)
            }
            Request::ListBays
            | Request::GetBooking { .. }
            | Request::ListBookings(_)
            | Request::ExportBookings(_)
            | Request::Agenda { .. }
            | Request::Occupancy { .. }
            | Request::Ready { .. }
            | Request::WaitingList { .. }
            | Request::Summary { .. }
            | Request::Listen { .. }
            | Request::Unlisten { .. } => Some(Permission::Read),
        }
    }
}

/// Resolve a required `[from, to)` pair.
pub fn window(from: &Instant, to: &Instant) -> Result<(Ms, Ms), ProtocolError> {
    Ok((from.resolve("from")?, to.resolve("to")?))
}

/// A range only when both ends are given. A lone bound is still parsed but
/// applies no filter.
pub fn optional_window(
    from: &Option<Instant>,
    to: &Option<Instant>,
) -> Result<Option<(Ms, Ms)>, ProtocolError> {
    match (from, to) {
        (Some(f), Some(t)) => window(f, t).map(Some),
        (Some(f), None) => f.resolve("from").map(|_| None),
        (None, Some(t)) => t.resolve("to").map(|_| None),
        (None, None) => Ok(None),
    }
}

/// Split a raw line into its `request_id` (kept even when the rest is malformed)
/// and the parsed request.
pub fn parse_line(line: &str) -> (Option<Value>, Result<Request, ProtocolError>) {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return (None, Err(ProtocolError::BadRequest(e.to_string()))),
    };
    let request_id = value.as_object_mut().and_then(|o| o.remove("request_id"));
    let request = serde_json::from_value(value).map_err(|e| ProtocolError::BadRequest(e.to_string()));
    (request_id, request)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(request_id: Option<Value>, data: Value) -> Self {
        Self {
            request_id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(request_id: Option<Value>, e: &ProtocolError) -> Self {
        Self {
            request_id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: e.code(),
                message: e.to_string(),
            }),
        }
    }
}
