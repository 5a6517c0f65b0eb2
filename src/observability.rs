use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "concierge_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "concierge_query_duration_seconds";

/// Counter: reservations created. Labels: status (pending/confirmed).
pub const RESERVATIONS_CREATED_TOTAL: &str = "concierge_reservations_created_total";

/// Counter: creation requests refused. Labels: reason.
pub const RESERVATION_REJECTIONS_TOTAL: &str = "concierge_reservation_rejections_total";

/// Counter: committed status changes. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "concierge_transitions_total";

/// Counter: approvals that ended in automatic rejection. Labels: reason.
pub const AUTO_REJECTIONS_TOTAL: &str = "concierge_auto_rejections_total";

// ── Background work ─────────────────────────────────────────────

pub const SWEEP_RUNS_TOTAL: &str = "concierge_sweep_runs_total";
pub const SWEEP_FINALIZED_TOTAL: &str = "concierge_sweep_finalized_total";
pub const SWEEP_FAILURES_TOTAL: &str = "concierge_sweep_failures_total";

/// Counter: notifications or emails that could not be delivered. Labels: kind.
pub const DISPATCH_FAILURES_TOTAL: &str = "concierge_dispatch_failures_total";

/// Counter: side effects dropped before dispatch. Labels: reason (full/closed).
pub const OUTBOX_DROPPED_TOTAL: &str = "concierge_outbox_dropped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "concierge_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "concierge_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "concierge_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "concierge_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "concierge_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "concierge_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
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
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SetStatus { .. } => "set_status",
        Command::HideReservation { .. } => "hide_reservation",
        Command::SelectOwnReservations => "select_own",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectPending => "select_pending",
        Command::SelectAmenityReservations { .. } => "select_amenity",
        Command::SelectOccupancy { .. } => "select_occupancy",
    }
}
