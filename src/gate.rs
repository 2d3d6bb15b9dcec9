use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

pub const DEFAULT_ADMISSION_LIMIT: usize = 40;

/// Fixed-capacity admission control for calls to external collaborators.
///
/// Owned by whoever orchestrates fan-out and passed in explicitly; clones share
/// one pool of permits. The permit is an RAII guard, so it is returned when the
/// admitted future completes, fails, panics, or is dropped mid-flight.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(DEFAULT_ADMISSION_LIMIT)
    }
}

impl AdmissionGate {
    /// A capacity of zero would deadlock every caller; it is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Wait until fewer than `capacity` units are in flight, then run `work`.
    pub async fn with_admission<F>(&self, work: F) -> F::Output
    where
        F: Future,
    {
        // The semaphore is never closed, so acquisition only fails if that
        // changes; in that case the work runs unthrottled rather than being lost.
        let _permit = self.permits.acquire().await.ok();
        let _gauge = InFlightGauge::enter();
        work.await
    }
}

/// Keeps the in-flight gauge honest on every exit path.
struct InFlightGauge;

impl InFlightGauge {
    fn enter() -> Self {
        metrics::gauge!(crate::observability::GATE_IN_FLIGHT).increment(1.0);
        InFlightGauge
    }
}

impl Drop for InFlightGauge {
    fn drop(&mut self) {
        metrics::gauge!(crate::observability::GATE_IN_FLIGHT).decrement(1.0);
    }
}
