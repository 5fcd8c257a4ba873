use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lendit_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lendit_query_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: bookings requested.
pub const BOOKINGS_REQUESTED_TOTAL: &str = "lendit_bookings_requested_total";

/// Counter: owner decisions. Labels: status.
pub const BOOKING_DECISIONS_TOTAL: &str = "lendit_booking_decisions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lendit_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lendit_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lendit_connections_rejected_total";

/// Counter: connections that ended with a protocol or I/O error.
pub const CONNECTION_ERRORS_TOTAL: &str = "lendit_connection_errors_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lendit_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lendit_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None; an
/// exporter that fails to bind is logged and the server runs without it.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterUser { .. } => "register_user",
        Command::UpdateUser { .. } => "update_user",
        Command::SelectUser { .. } => "select_user",
        Command::ListItem { .. } => "list_item",
        Command::UpdateItem { .. } => "update_item",
        Command::RequestBooking { .. } => "request_booking",
        Command::DecideBooking { .. } => "decide_booking",
        Command::PostComment { .. } => "post_comment",
        Command::PostRequest { .. } => "post_request",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectItem { .. } => "select_item",
        Command::SelectOwnerItems { .. } => "select_owner_items",
        Command::SearchItems { .. } => "search_items",
        Command::SelectRequest { .. } => "select_request",
        Command::SelectOwnRequests { .. } => "select_own_requests",
        Command::SelectOtherRequests { .. } => "select_other_requests",
    }
}
