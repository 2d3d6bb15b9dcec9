use std::io;

use ulid::Ulid;

use crate::error::{BookingError, ConflictReason};
use crate::model::{LockKey, Ms};

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A non-cancelled booking of the same schedule overlaps.
    Overlap(Ulid),
    LockHeld { key: LockKey, expires_at: Ms },
    LimitExceeded(&'static str),
    Invalid(&'static str),
    /// The caller's deadline passed before anything was written.
    Deadline,
    Wal { kind: io::ErrorKind, message: String },
}

impl StoreError {
    pub(crate) fn wal(e: io::Error) -> Self {
        StoreError::Wal {
            kind: e.kind(),
            message: e.to_string(),
        }
    }

    /// Failures worth retrying inside the store.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Wal {
                kind: io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut,
                ..
            }
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::Overlap(id) => write!(f, "overlaps booking: {id}"),
            StoreError::LockHeld { key, expires_at } => {
                write!(f, "lock {key} held until {expires_at}")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Invalid(msg) => write!(f, "invalid booking: {msg}"),
            StoreError::Deadline => write!(f, "deadline exceeded before commit"),
            StoreError::Wal { message, .. } => write!(f, "WAL error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(format!("booking {id}")),
            StoreError::AlreadyExists(id) => BookingError::Conflict(ConflictReason::Duplicate(id)),
            StoreError::Overlap(id) => BookingError::Conflict(ConflictReason::Overlap(id)),
            StoreError::LockHeld { key, .. } => {
                BookingError::Conflict(ConflictReason::SlotBeingClaimed(key))
            }
            StoreError::LimitExceeded(_) | StoreError::Invalid(_) => {
                BookingError::InvalidInput(e.to_string())
            }
            StoreError::Deadline => BookingError::Timeout,
            StoreError::Wal { .. } => BookingError::Internal(e.to_string()),
        }
    }
}
