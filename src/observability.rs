use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "berth_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "berth_query_duration_seconds";

/// Counter: reservation decisions. Labels: outcome (confirmed, waitlisted, replayed, or an error reason).
pub const RESERVATIONS_TOTAL: &str = "berth_reservations_total";

/// Histogram: time to decide a reservation, retries included.
pub const ARBITRATION_DURATION_SECONDS: &str = "berth_arbitration_duration_seconds";

pub const CANCELLATIONS_TOTAL: &str = "berth_cancellations_total";
pub const PROMOTIONS_TOTAL: &str = "berth_promotions_total";

/// Counter: requests refused by the per-requester rate limiter.
pub const RATE_LIMITED_TOTAL: &str = "berth_rate_limited_total";

// ── Outbox and reminders ────────────────────────────────────────

pub const OUTBOX_DELIVERED_TOTAL: &str = "berth_outbox_delivered_total";
pub const OUTBOX_FAILED_TOTAL: &str = "berth_outbox_failed_total";

/// Counter: entries that ran out of delivery attempts.
pub const OUTBOX_ABANDONED_TOTAL: &str = "berth_outbox_abandoned_total";

/// Gauge: entries still queued, sampled by the delivery worker.
pub const OUTBOX_PENDING: &str = "berth_outbox_pending";

pub const REMINDERS_SCHEDULED_TOTAL: &str = "berth_reminders_scheduled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "berth_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "berth_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "berth_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "berth_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "berth_wal_flush_batch_size";

/// Install the `tracing` subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::InsertProgram { .. } => "insert_program",
        Command::InsertOccurrence { .. } => "insert_occurrence",
        Command::InsertWindow { .. } => "insert_window",
        Command::InsertClosure { .. } => "insert_closure",
        Command::DeleteResource { .. } => "delete_resource",
        Command::DeleteWindow { .. } => "delete_window",
        Command::DeleteClosure { .. } => "delete_closure",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectResources => "select_resources",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectOutbox { .. } => "select_outbox",
        Command::DeleteOutbox { .. } => "delete_outbox",
        Command::InsertOutboxFailure { .. } => "insert_outbox_failure",
    }
}
