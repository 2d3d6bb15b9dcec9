mod conflict;
mod error;
mod locks;
mod mutations;
mod queries;

pub use conflict::validate_booking;
pub use error::StoreError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tokio::time::Instant;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::wal::Wal;

pub type SharedBookings = Arc<RwLock<ScheduleBookings>>;

/// What the Reservation Coordinator needs from shared storage: a lock
/// collection with unique identities and expiry, and an atomic
/// check-then-insert over the booking collection.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Create the lock for `key`, or fail with [`StoreError::LockHeld`] while
    /// a live lock exists. An expired lock is taken over.
    async fn try_lock(&self, key: LockKey, holder: Ulid, ttl: Duration) -> Result<BookingLock, StoreError>;

    /// Delete the lock if `holder` still owns it. `Ok(false)` when it did not.
    async fn unlock(&self, key: LockKey, holder: Ulid) -> Result<bool, StoreError>;

    /// Re-check for overlapping non-cancelled bookings and insert, atomically.
    /// `deadline` bounds only the wait to enter the transaction: past it the
    /// call fails with [`StoreError::Deadline`] and nothing is written. Once
    /// entered, the commit is awaited to its real outcome.
    async fn insert_exclusive(&self, booking: Booking, deadline: Instant) -> Result<Booking, StoreError>;

    /// Non-cancelled bookings of `key` overlapping `window`.
    async fn overlapping(&self, key: ScheduleKey, window: Span) -> Result<Vec<Booking>, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

const WAL_CHANNEL_CAPACITY: usize = 4096;
const WAL_BATCH_LIMIT: usize = 256;
const WAL_APPEND_ATTEMPTS: u32 = 3;

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Everything already queued is drained in one go; appends are
/// buffered and committed with a single fsync, and control commands first
/// commit whatever appends arrived before them.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    let mut inbox = Vec::with_capacity(WAL_BATCH_LIMIT);
    let mut batch: Vec<PendingAppend> = Vec::new();

    while rx.recv_many(&mut inbox, WAL_BATCH_LIMIT).await > 0 {
        for cmd in inbox.drain(..) {
            match cmd {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    commit_batch(&mut wal, &mut batch);
                    handle_control(&mut wal, other);
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: &mut Vec<PendingAppend>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut single = vec![(event, response)];
            commit_batch(wal, &mut single);
        }
    }
}

/// WAL-backed booking and lock store.
///
/// Bookings live per schedule behind a `tokio::sync::RwLock`; holding the
/// write half is the transaction boundary for check-then-insert. Locks live in
/// a `DashMap` keyed by their deterministic identity, so creation is atomic
/// per key.
pub struct Store {
    pub(super) schedules: DashMap<ScheduleKey, SharedBookings>,
    /// Reverse lookup: booking id → schedule.
    pub(super) booking_index: Arc<DashMap<Ulid, ScheduleKey>>,
    pub(super) locks: DashMap<LockKey, BookingLock>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold the read half while logging and applying; compaction
    /// takes the write half so no append slips between snapshot and swap.
    /// Always acquired before any schedule lock.
    pub(super) compaction: Arc<RwLock<()>>,
    pub(super) clock: Arc<dyn Clock>,
}

/// Apply an event to one schedule's bookings (caller holds the lock).
fn apply_to_schedule(sb: &mut ScheduleBookings, event: &Event, index: &DashMap<Ulid, ScheduleKey>) {
    match event {
        Event::BookingCreated(booking) => {
            // A retried append may have logged the same booking twice.
            if index.insert(booking.id, booking.key).is_none() {
                sb.insert(booking.clone());
            }
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = sb.get_mut(*id) {
                b.status = *status;
            }
        }
    }
}

impl Store {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a Tokio runtime.
    pub fn open(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_index = Arc::new(DashMap::new());
        let mut rebuilt: HashMap<ScheduleKey, ScheduleBookings> = HashMap::new();
        for event in &events {
            let key = event.key();
            let sb = rebuilt.entry(key).or_insert_with(|| ScheduleBookings::new(key));
            apply_to_schedule(sb, event, &booking_index);
        }

        let schedules = DashMap::new();
        for (key, sb) in rebuilt {
            schedules.insert(key, Arc::new(RwLock::new(sb)));
        }

        tracing::debug!(
            path = %wal_path.display(),
            events = events.len(),
            bookings = booking_index.len(),
            "store replayed"
        );

        Ok(Self {
            schedules,
            booking_index,
            locks: DashMap::new(),
            wal_tx,
            compaction: Arc::new(RwLock::new(())),
            clock,
        })
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(super) fn schedule(&self, key: &ScheduleKey) -> Option<SharedBookings> {
        self.schedules.get(key).map(|e| e.value().clone())
    }

    pub(super) fn schedule_or_create(&self, key: ScheduleKey) -> SharedBookings {
        self.schedules
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(ScheduleBookings::new(key))))
            .value()
            .clone()
    }

    /// WAL-append then apply, on a task of its own so a caller that gives up
    /// halfway never leaves the log and memory disagreeing. The guards move
    /// into the task and are released only when both halves are done.
    pub(super) async fn persist_and_apply(
        &self,
        writing: OwnedRwLockReadGuard<()>,
        mut guard: OwnedRwLockWriteGuard<ScheduleBookings>,
        event: Event,
    ) -> Result<(), StoreError> {
        let wal_tx = self.wal_tx.clone();
        let index = self.booking_index.clone();
        let commit = tokio::spawn(async move {
            wal_append(&wal_tx, &event).await?;
            apply_to_schedule(&mut guard, &event, &index);
            drop(guard);
            drop(writing);
            Ok::<(), StoreError>(())
        });
        commit
            .await
            .map_err(|e| StoreError::wal(io::Error::other(e.to_string())))?
    }
}

async fn wal_append_once(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| StoreError::wal(io::Error::other("WAL writer shut down")))?;
    rx.await
        .map_err(|_| StoreError::wal(io::Error::other("WAL writer dropped response")))?
        .map_err(StoreError::wal)
}

/// Append through the group-commit writer, retrying transient failures.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), StoreError> {
    let mut attempt = 1;
    loop {
        match wal_append_once(wal_tx, event).await {
            Err(e) if e.is_transient() && attempt < WAL_APPEND_ATTEMPTS => {
                tracing::debug!(attempt, error = %e, "retrying WAL append");
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[async_trait]
impl BookingStore for Store {
    async fn try_lock(&self, key: LockKey, holder: Ulid, ttl: Duration) -> Result<BookingLock, StoreError> {
        self.acquire_lock(key, holder, ttl)
    }

    async fn unlock(&self, key: LockKey, holder: Ulid) -> Result<bool, StoreError> {
        Ok(self.release_lock(&key, holder))
    }

    async fn insert_exclusive(&self, booking: Booking, deadline: Instant) -> Result<Booking, StoreError> {
        self.insert_booking_before(booking, deadline).await
    }

    async fn overlapping(&self, key: ScheduleKey, window: Span) -> Result<Vec<Booking>, StoreError> {
        Ok(self.active_bookings(key, window).await)
    }
}
