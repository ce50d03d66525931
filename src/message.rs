//! Text of booking notifications: `{placeholder}` templates and the built-in layout.
//!
//! Messages are sent with HTML parse mode, so every substituted value is escaped.

use std::collections::HashMap;
use std::fmt::Write;

use chrono::FixedOffset;

use crate::labels::Labels;
use crate::model::{Booking, EventKind, RealtimeEvent};
use crate::timefmt::{format_iso, format_pretty};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    Created,
    Updated,
    Rescheduled,
    Canceled,
    Closed,
}

impl Announcement {
    /// Which announcement, if any, a broadcast event calls for.
    /// Deletions and bay changes are not announced.
    pub fn for_event(event: &RealtimeEvent) -> Option<Self> {
        let booking = event.as_booking()?;
        match event.kind {
            EventKind::BookingCreated => Some(Announcement::Created),
            EventKind::BookingUpdated => match event.previous {
                Some(prev) if prev != booking.span() => Some(Announcement::Rescheduled),
                _ => Some(Announcement::Updated),
            },
            EventKind::BookingCanceled => Some(Announcement::Canceled),
            EventKind::BookingClosed => Some(Announcement::Closed),
            _ => None,
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Announcement::Created => "🆕",
            Announcement::Updated => "✏️",
            Announcement::Rescheduled => "📅",
            Announcement::Canceled => "🚫",
            Announcement::Closed => "✅",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Announcement::Created => "New booking",
            Announcement::Updated => "Booking updated",
            Announcement::Rescheduled => "Booking rescheduled",
            Announcement::Canceled => "Booking canceled",
            Announcement::Closed => "Booking ready",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Announcement::Created => "created",
            Announcement::Updated => "updated",
            Announcement::Rescheduled => "rescheduled",
            Announcement::Canceled => "canceled",
            Announcement::Closed => "closed",
        }
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Placeholder values for one booking, already HTML-escaped.
pub fn placeholders(
    booking: &Booking,
    announcement: Announcement,
    bay_name: &str,
    labels: &Labels,
    offset: &FixedOffset,
) -> HashMap<String, String> {
    let mut data = HashMap::new();
    let mut put = |key: &str, value: &str| {
        data.insert(key.to_string(), escape_html(value));
    };

    let number = booking.display_number();
    put("booking_id", &number);
    put("number", &number);
    put("title", &booking.title);
    put("complaint", &booking.complaint);
    put("description", &booking.description);
    put("status", booking.status.as_str());
    put("status_icon", announcement.icon());
    put("status_name", announcement.title());

    let start = format_pretty(booking.start, offset);
    put("start", &start);
    put("start_pretty", &start);
    put("start_iso", &format_iso(booking.start, offset));
    let (end, end_iso) = booking
        .end
        .map(|e| (format_pretty(e, offset), format_iso(e, offset)))
        .unwrap_or_default();
    put("end", &end);
    put("end_pretty", &end);
    put("end_iso", &end_iso);

    put("unit", &labels.unit(&booking.vehicle_id));
    if let Some(v) = labels.vehicle(&booking.vehicle_id) {
        for prefix in ["unit", "vehicle"] {
            put(&format!("{prefix}_plate"), &v.plate);
            put(&format!("{prefix}_vin"), &v.vin);
            put(&format!("{prefix}_make"), &v.make);
            put(&format!("{prefix}_model"), &v.model);
        }
    }

    put("bay_name", bay_name);
    if let Some(c) = &booking.company_id {
        put("company_name", &labels.company(c));
    }
    if !booking.service_ref.is_empty() {
        put("service_ref", &booking.service_ref);
        put("fullbay_service_id", &booking.service_ref);
    }
    if !booking.technician_ids.is_empty() {
        put("technician_names", &labels.technician_names(&booking.technician_ids).join(", "));
    }
    data
}

/// Replace `{key}` tokens with values from `data`. Unknown tokens stay as written.
pub fn render(template: &str, data: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['{', '}']) {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let key = &after[..close];
                match data.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Built-in layout used when no template is configured or the template renders blank.
pub fn fallback(announcement: Announcement, data: &HashMap<String, String>) -> String {
    let get = |key: &str| data.get(key).map(String::as_str).unwrap_or("");
    let mut sb = String::new();

    let _ = write!(
        sb,
        "{} <b>{}</b> • <b>#{}</b>\n\n",
        announcement.icon(),
        announcement.title(),
        get("number")
    );
    if !get("complaint").is_empty() {
        let _ = writeln!(sb, "<b>Complaint:</b> {}", get("complaint"));
    }
    if get("description").is_empty() {
        sb.push('\n');
    } else {
        let _ = write!(sb, "<b>Description:</b> {}\n\n", get("description"));
    }

    let (unit, plate, vin) = (get("unit"), get("unit_plate"), get("unit_vin"));
    if !unit.is_empty() {
        let _ = write!(sb, "<b>Unit:</b> {unit}");
        if !plate.is_empty() || !vin.is_empty() {
            let _ = write!(sb, "  ({plate} {vin})");
        }
        sb.push('\n');
    }
    if !get("bay_name").is_empty() {
        let _ = writeln!(sb, "<b>Bay:</b> {}", get("bay_name"));
    }
    if !get("company_name").is_empty() {
        let _ = writeln!(sb, "<b>Company:</b> {}", get("company_name"));
    }
    if get("service_ref").is_empty() {
        sb.push('\n');
    } else {
        let _ = write!(sb, "<b>Service:</b> {}\n\n", get("service_ref"));
    }
    if get("technician_names").is_empty() {
        sb.push('\n');
    } else {
        let _ = write!(sb, "<b>Technicians:</b> {}\n\n", get("technician_names"));
    }

    let _ = writeln!(sb, "<b>Start:</b> {}", get("start"));
    if !get("end").is_empty() {
        let _ = writeln!(sb, "<b>End:</b> {}", get("end"));
    }
    sb
}

/// Template if configured and non-blank after rendering, otherwise the built-in layout.
pub fn compose(
    template: Option<&str>,
    announcement: Announcement,
    data: &HashMap<String, String>,
) -> String {
    template
        .map(|t| render(t, data))
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| fallback(announcement, data))
}
