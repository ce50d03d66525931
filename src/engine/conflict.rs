use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Overlapping active bookings a bay tolerates before a candidate is refused.
pub const OCCUPANCY_THRESHOLD: usize = 1;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Pure overlap test over half-open intervals; an absent end is unbounded.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

fn check_instant(t: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    check_instant(span.start)?;
    if let Some(end) = span.end {
        check_instant(end)?;
    }
    if !span.is_well_formed() {
        return Err(EngineError::InvalidInput("end must not precede start".into()));
    }
    Ok(())
}

/// `[from, to)` query window.
pub(crate) fn validate_window(from: Ms, to: Ms) -> Result<(), EngineError> {
    check_instant(from)?;
    check_instant(to)?;
    if to < from {
        return Err(EngineError::InvalidInput("range end must not precede range start".into()));
    }
    if to - from > crate::limits::MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Accept or refuse a booking of `span` on `bay_id` given the bookings already there.
///
/// Callers pass the bay's bookings with the candidate's own prior record removed.
/// Terminal bookings and bookings on other bays are ignored.
pub fn validate_booking_conflict<'a>(
    bay_id: Ulid,
    span: &Span,
    existing: impl IntoIterator<Item = &'a Booking>,
) -> Result<(), EngineError> {
    let mut overlapping = 0usize;
    for booking in existing {
        if booking.bay_id != bay_id || !booking.is_active() {
            continue;
        }
        if booking.span().overlaps(span) {
            overlapping += 1;
            if overlapping >= OCCUPANCY_THRESHOLD {
                return Err(EngineError::Conflict {
                    bay_id,
                    booking_id: booking.id,
                });
            }
        }
    }
    Ok(())
}
