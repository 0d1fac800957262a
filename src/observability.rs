use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── Booking activity ────────────────────────────────────────────

/// Counter: bookings created. Labels: flow.
pub const BOOKINGS_CREATED_TOTAL: &str = "labslot_bookings_created_total";

/// Counter: status changes. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "labslot_booking_transitions_total";

/// Counter: bulk delays that shifted at least one booking.
pub const DELAYS_APPLIED_TOTAL: &str = "labslot_delays_applied_total";

/// Histogram: bookings shifted per delay.
pub const DELAY_AFFECTED_BOOKINGS: &str = "labslot_delay_affected_bookings";

/// Counter: notification attempts. Labels: template, status.
pub const NOTIFICATIONS_TOTAL: &str = "labslot_notifications_total";

/// Counter: rejected operations. Labels: op, kind.
pub const OPERATION_ERRORS_TOTAL: &str = "labslot_operation_errors_total";

// ── Storage ─────────────────────────────────────────────────────

/// Gauge: instruments currently loaded.
pub const INSTRUMENTS_ACTIVE: &str = "labslot_instruments_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labslot_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// `RUST_LOG`-driven fmt subscriber, `info` when unset. Logs go to stderr so
/// JSON output on stdout stays clean.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
