use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::error::{BookingError, ConflictReason};
use crate::model::*;
use crate::observability::*;
use crate::store::{BookingStore, StoreError, validate_booking};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Expiry stamped on every slot lock; the backstop if a holder dies.
    pub lock_ttl: Duration,
    /// Budget for deleting the lock, independent of the caller's deadline.
    pub release_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }
}

/// A fully resolved reservation: the schedule is known, the slot is concrete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub key: ScheduleKey,
    pub span: Span,
    pub capacity: u32,
    pub participants: BTreeMap<String, String>,
    pub managers: BTreeMap<String, String>,
}

/// Creates bookings without double-booking a schedule.
///
/// Each attempt runs lock → transactional check-and-insert → release, in that
/// order. The lock turns away concurrent attempts on the identical slot before
/// they reach the store's transaction; the transaction's overlap re-check is
/// what actually keeps bookings disjoint. The caller's deadline can end an
/// attempt only before the transaction commits anything. Release always runs,
/// on its own timeout, and is also triggered from `Drop` if the caller
/// abandons the attempt mid-way.
pub struct ReservationCoordinator {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
}

impl ReservationCoordinator {
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>, settings: CoordinatorSettings) -> Self {
        Self { store, clock, settings }
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    pub async fn reserve(&self, request: ReservationRequest, deadline: Instant) -> Result<Booking, BookingError> {
        let started = std::time::Instant::now();
        let result = self.attempt(request, deadline).await;

        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.label(),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(RESERVATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn attempt(&self, request: ReservationRequest, deadline: Instant) -> Result<Booking, BookingError> {
        let booking = self.prepare(request)?;
        let lock_key = LockKey::new(booking.key, booking.span.start);
        let holder = Ulid::new();

        let lock = match timeout_at(deadline, self.store.try_lock(lock_key, holder, self.settings.lock_ttl)).await {
            Err(_) => return Err(BookingError::Timeout),
            Ok(Err(StoreError::LockHeld { expires_at, .. })) => {
                metrics::counter!(LOCK_CONTENTION_TOTAL).increment(1);
                debug!(lock = %lock_key, expires_at, "slot is being claimed by another request");
                return Err(BookingError::Conflict(ConflictReason::SlotBeingClaimed(lock_key)));
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(lock)) => lock,
        };
        let guard = HeldLock::new(self.store.clone(), lock, self.settings.release_timeout);

        // The deadline only bounds entry into the transaction; a commit that
        // has started is always awaited, so `Timeout` never hides a booking.
        let inserted = self
            .store
            .insert_exclusive(booking, deadline)
            .await
            .map_err(BookingError::from);

        guard.release().await;
        inserted
    }

    /// Validate and build the booking. Runs before any side effect.
    fn prepare(&self, request: ReservationRequest) -> Result<Booking, BookingError> {
        if request.span.end <= request.span.start {
            return Err(BookingError::invalid("slot end must be after its start"));
        }
        let booking = Booking {
            id: Ulid::new(),
            key: request.key,
            span: request.span,
            capacity: request.capacity,
            participants: request.participants,
            status: BookingStatus::Confirmed,
            managers: request.managers,
            created_at: self.clock.now_ms(),
        };
        validate_booking(&booking)?;
        Ok(booking)
    }
}

/// A slot lock owned by one attempt. Released explicitly on the normal path;
/// if dropped while still held, a release task is spawned instead.
struct HeldLock {
    store: Arc<dyn BookingStore>,
    lock: BookingLock,
    release_timeout: Duration,
    released: bool,
}

impl HeldLock {
    fn new(store: Arc<dyn BookingStore>, lock: BookingLock, release_timeout: Duration) -> Self {
        Self {
            store,
            lock,
            release_timeout,
            released: false,
        }
    }

    /// If this future is itself dropped midway, `Drop` starts a fresh release.
    async fn release(mut self) {
        release_lock(self.store.clone(), self.lock.clone(), self.release_timeout).await;
        self.released = true;
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let (store, lock, budget) = (self.store.clone(), self.lock.clone(), self.release_timeout);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_lock(store, lock, budget));
            }
            Err(_) => warn!(lock = %lock.key, "no runtime to release lock; leaving it to expire"),
        }
    }
}

/// Failures are logged and counted, never surfaced: the lock expires anyway.
async fn release_lock(store: Arc<dyn BookingStore>, lock: BookingLock, budget: Duration) {
    match timeout(budget, store.unlock(lock.key, lock.holder)).await {
        Ok(Ok(true)) => debug!(lock = %lock.key, "lock released"),
        Ok(Ok(false)) => debug!(lock = %lock.key, "lock already gone or taken over"),
        Ok(Err(e)) => {
            metrics::counter!(LOCK_RELEASE_FAILURES_TOTAL).increment(1);
            warn!(lock = %lock.key, error = %e, "lock release failed; it will expire");
        }
        Err(_) => {
            metrics::counter!(LOCK_RELEASE_FAILURES_TOTAL).increment(1);
            warn!(lock = %lock.key, "lock release timed out; it will expire");
        }
    }
}
