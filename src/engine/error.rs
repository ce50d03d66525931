use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    InvalidInput(String),
    NotFound(Ulid),
    /// The candidate overlaps `booking_id` on `bay_id`.
    Conflict {
        bay_id: Ulid,
        booking_id: Ulid,
    },
    InvalidState(String),
    AlreadyExists(String),
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    Timeout,
    WalError(String),
}

impl EngineError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => "invalid_input",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict { .. } | EngineError::AlreadyExists(_) => "conflict",
            EngineError::InvalidState(_) | EngineError::HasBookings(_) => "invalid_state",
            EngineError::Timeout => "unavailable",
            EngineError::WalError(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict { .. } => write!(f, "bay is already booked in this timeframe"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete bay {id}: has active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout => write!(f, "timed out waiting for bay lock"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
