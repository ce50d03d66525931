use std::collections::HashMap;

use chrono::FixedOffset;
use ulid::Ulid;

use crate::labels::Labels;
use crate::model::Booking;
use crate::timefmt::format_pretty;

const HEADER: [&str; 10] = [
    "number",
    "complaint",
    "description",
    "unit",
    "bay",
    "company",
    "technicians",
    "start",
    "end",
    "status",
];

/// Quote a field when it holds a delimiter, quote or line break.
fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

fn push_record<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_field(out, field);
    }
    out.push('\n');
}

/// Render bookings as CSV in the order given. Dates use the display offset.
/// Bays missing from `bay_names` show their id.
pub fn bookings_csv(
    bookings: &[Booking],
    bay_names: &HashMap<Ulid, String>,
    labels: &Labels,
    offset: &FixedOffset,
) -> String {
    let mut out = String::new();
    push_record(&mut out, HEADER);
    for b in bookings {
        let bay = bay_names
            .get(&b.bay_id)
            .cloned()
            .unwrap_or_else(|| b.bay_id.to_string());
        let company = b.company_id.as_deref().map(|c| labels.company(c)).unwrap_or_default();
        let technicians = labels.technician_names(&b.technician_ids).join(", ");
        let end = b.end.map(|e| format_pretty(e, offset)).unwrap_or_default();
        let row = [
            b.display_number(),
            b.complaint.clone(),
            b.description.clone(),
            labels.unit(&b.vehicle_id),
            bay,
            company,
            technicians,
            format_pretty(b.start, offset),
            end,
            b.status.as_str().to_string(),
        ];
        push_record(&mut out, row.iter().map(String::as_str));
    }
    out
}

pub fn export_filename(at_ms: i64) -> String {
    format!("bookings-{}.csv", at_ms / 1000)
}
