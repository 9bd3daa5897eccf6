use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: RPC statements executed. Labels: command, status.
pub const RPC_TOTAL: &str = "cleanup_rpc_total";

/// Histogram: RPC latency in seconds. Labels: command.
pub const RPC_DURATION_SECONDS: &str = "cleanup_rpc_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings admitted.
pub const BOOKINGS_CREATED_TOTAL: &str = "cleanup_bookings_created_total";

/// Counter: bookings removed. Labels: reason (cancelled, rated).
pub const BOOKINGS_CLOSED_TOTAL: &str = "cleanup_bookings_closed_total";

/// Counter: rejected scheduler calls. Labels: operation, reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "cleanup_booking_rejections_total";

// ── Store ───────────────────────────────────────────────────────

/// Counter: commits aborted by a stale read (each one is retried).
pub const TXN_ABORTS_TOTAL: &str = "cleanup_txn_aborts_total";

/// Counter: transactions that ran out of attempts.
pub const TXN_CONTENTION_TOTAL: &str = "cleanup_txn_contention_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cleanup_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "cleanup_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "cleanup_wal_compactions_total";

/// Counter: schedule projection rebuilds after falling behind.
pub const PROJECTION_REBUILDS_TOTAL: &str = "cleanup_projection_rebuilds_total";

// ── Connections ─────────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "cleanup_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "cleanup_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "cleanup_connections_rejected_total";

/// Counter: failed logins.
pub const AUTH_FAILURES_TOTAL: &str = "cleanup_auth_failures_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateBooking { .. } => "create_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RateBooking { .. } => "rate_booking",
        Command::SelectMySchedule => "my_schedule",
        Command::SelectProviderRating { .. } => "provider_rating",
    }
}
