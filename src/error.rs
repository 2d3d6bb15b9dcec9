use ulid::Ulid;

use crate::model::LockKey;

/// Why a reservation or insert was refused without any write taking place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another request currently holds the advisory lock for this exact slot.
    SlotBeingClaimed(LockKey),
    /// An existing booking overlaps the requested interval.
    Overlap(Ulid),
    /// A record with this id already exists.
    Duplicate(Ulid),
}

/// Outcome taxonomy shared by every public operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Bad shape or range; raised before any side effect.
    InvalidInput(String),
    Conflict(ConflictReason),
    NotFound(String),
    /// Unexpected collaborator or datastore failure; the caller may retry.
    Internal(String),
    /// The caller's deadline expired mid-flow.
    Timeout,
}

impl BookingError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        BookingError::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BookingError::Internal(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BookingError::Conflict(_))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            BookingError::InvalidInput(_) => "invalid_input",
            BookingError::Conflict(_) => "conflict",
            BookingError::NotFound(_) => "not_found",
            BookingError::Internal(_) => "internal",
            BookingError::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::SlotBeingClaimed(key) => {
                write!(f, "slot {key} is currently being claimed by another request")
            }
            ConflictReason::Overlap(id) => write!(f, "overlaps existing booking {id}"),
            ConflictReason::Duplicate(id) => write!(f, "already exists: {id}"),
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            BookingError::Conflict(reason) => write!(f, "conflict: {reason}"),
            BookingError::NotFound(what) => write!(f, "not found: {what}"),
            BookingError::Internal(msg) => write!(f, "internal error: {msg}"),
            BookingError::Timeout => write!(f, "deadline exceeded"),
        }
    }
}

impl std::error::Error for BookingError {}
