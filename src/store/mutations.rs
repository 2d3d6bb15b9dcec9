use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, oneshot};
use tokio::time::{Instant, timeout_at};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_no_overlap, validate_booking};
use super::{ScheduleBookings, Store, StoreError, WalCommand};

impl Store {
    /// Check-then-insert under the schedule's write lock: re-query overlapping
    /// non-cancelled bookings and, if none, log and apply the new one.
    pub async fn insert_booking(&self, booking: Booking) -> Result<Booking, StoreError> {
        validate_booking(&booking)?;
        let writing = self.compaction.clone().read_owned().await;
        let guard = self.schedule_or_create(booking.key).write_owned().await;
        self.insert_locked(writing, guard, booking).await
    }

    /// Like [`Store::insert_booking`], but gives up with
    /// [`StoreError::Deadline`] if the schedule's write lock is not ours by
    /// `deadline`. Once it is, the insert runs to completion regardless.
    pub async fn insert_booking_before(&self, booking: Booking, deadline: Instant) -> Result<Booking, StoreError> {
        validate_booking(&booking)?;
        let schedule = self.schedule_or_create(booking.key);
        let compaction = self.compaction.clone();
        let (writing, guard) = timeout_at(deadline, async move {
            let writing = compaction.read_owned().await;
            (writing, schedule.write_owned().await)
        })
        .await
        .map_err(|_| StoreError::Deadline)?;
        self.insert_locked(writing, guard, booking).await
    }

    async fn insert_locked(
        &self,
        writing: OwnedRwLockReadGuard<()>,
        guard: OwnedRwLockWriteGuard<ScheduleBookings>,
        booking: Booking,
    ) -> Result<Booking, StoreError> {
        if self.booking_index.contains_key(&booking.id) {
            return Err(StoreError::AlreadyExists(booking.id));
        }
        check_no_overlap(&guard, &booking)?;

        self.persist_and_apply(writing, guard, Event::BookingCreated(booking.clone()))
            .await?;
        tracing::debug!(booking = %booking.id, schedule = %booking.key, "booking inserted");
        Ok(booking)
    }

    /// Mark a booking cancelled so it stops blocking its interval. Cancelling
    /// twice is a no-op.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        self.set_status(id, BookingStatus::Cancelled).await
    }

    pub async fn set_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, StoreError> {
        let writing = self.compaction.clone().read_owned().await;
        let key = self
            .booking_index
            .get(&id)
            .map(|k| *k.value())
            .ok_or(StoreError::NotFound(id))?;
        let mut guard = self
            .schedule(&key)
            .ok_or(StoreError::NotFound(id))?
            .write_owned()
            .await;

        let current = guard.get_mut(id).ok_or(StoreError::NotFound(id))?;
        if current.status == status {
            return Ok(current.clone());
        }
        if current.status == BookingStatus::Cancelled {
            // Its interval may already belong to a newer booking.
            return Err(StoreError::Invalid("cancelled bookings cannot be reopened"));
        }
        let mut updated = current.clone();
        updated.status = status;

        self.persist_and_apply(writing, guard, Event::BookingStatusChanged { id, key, status })
            .await?;
        Ok(updated)
    }

    /// Rewrite the WAL as one `BookingCreated` per live booking. Cancelled
    /// bookings are left out.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _exclusive = self.compaction.write().await;

        let shared: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for sb in shared {
            let guard = sb.read().await;
            events.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.blocks_time())
                    .cloned()
                    .map(Event::BookingCreated),
            );
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::wal(std::io::Error::other("WAL writer shut down")))?;
        rx.await
            .map_err(|_| StoreError::wal(std::io::Error::other("WAL writer dropped response")))?
            .map_err(StoreError::wal)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
