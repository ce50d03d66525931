//! Instant parsing and human-readable formatting.

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, Utc};

use crate::model::Ms;

/// `01/02/2006, 03:04 PM`
const PRETTY: &str = "%m/%d/%Y, %I:%M %p";

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parse an instant given as RFC 3339 (with or without fractional seconds),
/// a zone-less `YYYY-MM-DDTHH:MM[:SS[.fff]]` read as UTC, or Unix milliseconds.
pub fn parse_instant(input: &str) -> Option<Ms> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().enumerate().all(|(i, b)| b.is_ascii_digit() || (i == 0 && b == b'-')) {
        return s.parse().ok();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// `+05:30`, `-04:00`, `Z` or `UTC`.
pub fn parse_offset(input: &str) -> Option<FixedOffset> {
    let s = input.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = h.parse().ok()?;
    let minutes: i32 = m.parse().ok()?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn local(ms: Ms, offset: &FixedOffset) -> Option<DateTime<FixedOffset>> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.with_timezone(offset))
}

/// `03/14/2025, 09:30 AM` in the display offset. Empty if out of range.
pub fn format_pretty(ms: Ms, offset: &FixedOffset) -> String {
    local(ms, offset)
        .map(|dt| dt.format(PRETTY).to_string())
        .unwrap_or_default()
}

/// RFC 3339 with whole seconds, e.g. `2025-03-14T09:30:00-04:00`.
pub fn format_iso(ms: Ms, offset: &FixedOffset) -> String {
    local(ms, offset)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
