use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::observability::LOCKS_REAPED_TOTAL;
use crate::store::Store;

/// Periodically delete slot locks whose holder never released them.
pub async fn run_lock_reaper(store: Arc<Store>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let reaped = store.sweep_expired_locks();
        if reaped > 0 {
            metrics::counter!(LOCKS_REAPED_TOTAL).increment(reaped as u64);
            info!(reaped, "reaped expired slot locks");
        }
    }
    debug!("lock reaper stopped");
}

/// Rewrite the WAL once `threshold` appends have piled up since the last
/// compaction. Checked every `every`.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => warn!(error = %e, "WAL compaction failed"),
        }
    }
    debug!("compactor stopped");
}
