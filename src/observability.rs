use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "seatline_requests_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "seatline_request_duration_seconds";

/// Counter: registration decisions. Labels: outcome (enrolled, waitlisted, rejected).
pub const REGISTRATIONS_TOTAL: &str = "seatline_registrations_total";

/// Counter: waitlist heads processed by promotion. Labels: outcome (promoted, rejected).
pub const PROMOTIONS_TOTAL: &str = "seatline_promotions_total";

// ── Integrity ───────────────────────────────────────────────────

/// Counter: invariant violations (each halts a section).
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "seatline_invariant_violations_total";

/// Counter: requests abandoned while waiting for a section.
pub const LOCK_TIMEOUTS_TOTAL: &str = "seatline_lock_timeouts_total";

/// Counter: transactions whose WAL append failed.
pub const WAL_FAILURES_TOTAL: &str = "seatline_wal_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "seatline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "seatline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "seatline_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "seatline_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "seatline_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatline_wal_flush_batch_size";

/// Install the tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("seatline=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {e}");
    }
}

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSection { .. } => "insert_section",
        Command::UpdateSection { .. } => "update_section",
        Command::ArchiveTerm { .. } => "archive_term",
        Command::Register { .. } => "register",
        Command::Drop { .. } => "drop",
        Command::InsertCompletedCourses { .. } => "insert_completed_courses",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::SelectSectionStatus { .. } => "select_section_status",
        Command::SelectSections { .. } => "select_sections",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectEnrollments { .. } => "select_enrollments",
        Command::SelectHolds { .. } => "select_holds",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
