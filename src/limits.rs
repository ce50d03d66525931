use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_BAYS: usize = 10_000;
pub const MAX_BOOKINGS_PER_BAY: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_TECHNICIANS: usize = 32;

/// Widest range accepted by agenda, ready and summary queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 5 * 366 * DAY_MS;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_LINE_LEN: usize = 64 * 1024;
pub const MAX_LISTEN_CHANNELS: usize = 64;
