use std::time::Duration;

use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::clock::duration_ms;
use crate::model::*;

use super::{Store, StoreError};

impl Store {
    /// Create the lock record for `key`. The map entry is held for the whole
    /// check-and-insert, so two callers can never both create it.
    pub fn acquire_lock(&self, key: LockKey, holder: Ulid, ttl: Duration) -> Result<BookingLock, StoreError> {
        let now = self.clock.now_ms();
        let lock = BookingLock {
            key,
            holder,
            expires_at: now.saturating_add(duration_ms(ttl)),
        };
        match self.locks.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(lock.clone());
                Ok(lock)
            }
            Entry::Occupied(mut held) if held.get().is_expired(now) => {
                tracing::debug!(lock = %key, previous = %held.get().holder, "taking over expired lock");
                held.insert(lock.clone());
                Ok(lock)
            }
            Entry::Occupied(held) => Err(StoreError::LockHeld {
                key,
                expires_at: held.get().expires_at,
            }),
        }
    }

    /// Remove the lock only if `holder` still owns it.
    pub fn release_lock(&self, key: &LockKey, holder: Ulid) -> bool {
        self.locks.remove_if(key, |_, lock| lock.holder == holder).is_some()
    }

    pub fn lock_for(&self, key: &LockKey) -> Option<BookingLock> {
        self.locks.get(key).map(|l| l.value().clone())
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Drop every lock whose expiry has passed. Returns how many were removed.
    pub fn sweep_expired_locks(&self) -> usize {
        let now = self.clock.now_ms();
        let mut reaped = 0;
        self.locks.retain(|_, lock| {
            let live = !lock.is_expired(now);
            if !live {
                reaped += 1;
            }
            live
        });
        reaped
    }
}
