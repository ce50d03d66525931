use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "baybook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "baybook_request_duration_seconds";

/// Counter: writes refused because the bay was already booked. Labels: op.
pub const BOOKING_CONFLICTS_TOTAL: &str = "baybook_booking_conflicts_total";

/// Counter: bay locks not acquired before the deadline.
pub const LOCK_TIMEOUTS_TOTAL: &str = "baybook_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "baybook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "baybook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "baybook_connections_rejected_total";

/// Counter: failed auth attempts.
pub const AUTH_FAILURES_TOTAL: &str = "baybook_auth_failures_total";

/// Counter: broadcast events a slow subscriber missed.
pub const BROADCAST_LAGGED_TOTAL: &str = "baybook_broadcast_lagged_total";

/// Counter: outbound notifications. Labels: outcome (sent, failed).
pub const NOTIFICATIONS_TOTAL: &str = "baybook_notifications_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "baybook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "baybook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::CreateBay { .. } => "create_bay",
        Request::UpdateBay { .. } => "update_bay",
        Request::DeleteBay { .. } => "delete_bay",
        Request::ListBays => "list_bays",
        Request::CreateBooking(_) => "create_booking",
        Request::UpdateBooking { .. } => "update_booking",
        Request::CloseBooking { .. } => "close_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::DeleteBooking { .. } => "delete_booking",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings(_) => "list_bookings",
        Request::ExportBookings(_) => "export_bookings",
        Request::Agenda { .. } => "agenda",
        Request::Occupancy { .. } => "occupancy",
        Request::Ready { .. } => "ready",
        Request::WaitingList { .. } => "waiting_list",
        Request::Summary { .. } => "summary",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
        Request::GetNotifySettings => "get_notify_settings",
        Request::SetNotifySettings { .. } => "set_notify_settings",
    }
}
