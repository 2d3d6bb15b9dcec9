use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── Reservations ────────────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "slotd_reservations_total";

/// Histogram: end-to-end reservation latency in seconds.
pub const RESERVATION_DURATION_SECONDS: &str = "slotd_reservation_duration_seconds";

/// Counter: attempts refused because another request held the slot lock.
pub const LOCK_CONTENTION_TOTAL: &str = "slotd_lock_contention_total";

/// Counter: lock deletes that failed or timed out (left to expire).
pub const LOCK_RELEASE_FAILURES_TOTAL: &str = "slotd_lock_release_failures_total";

/// Counter: expired locks removed by the reaper.
pub const LOCKS_REAPED_TOTAL: &str = "slotd_locks_reaped_total";

// ── Search ──────────────────────────────────────────────────────

/// Histogram: search flow latency in seconds.
pub const SEARCH_DURATION_SECONDS: &str = "slotd_search_duration_seconds";

/// Counter: fan-out branches dropped from a search. Labels: stage.
pub const SEARCH_BRANCH_FAILURES_TOTAL: &str = "slotd_search_branch_failures_total";

/// Gauge: units of work currently admitted by the gate.
pub const GATE_IN_FLIGHT: &str = "slotd_gate_in_flight";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Install the Prometheus exporter on `port`. No-op if `port` is `None`.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_disabled_without_port() {
        assert!(init_metrics(None).is_ok());
    }

    #[test]
    fn tracing_init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
