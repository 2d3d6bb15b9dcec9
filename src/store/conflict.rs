use crate::limits::*;
use crate::model::*;

use super::StoreError;

pub(crate) fn validate_span(span: &Span) -> Result<(), StoreError> {
    if span.end <= span.start {
        return Err(StoreError::Invalid("end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(StoreError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(StoreError::LimitExceeded("booking too long"));
    }
    Ok(())
}

/// Shape checks for a booking about to be written.
pub fn validate_booking(booking: &Booking) -> Result<(), StoreError> {
    validate_span(&booking.span)?;
    if booking.capacity == 0 {
        return Err(StoreError::Invalid("capacity must be at least 1"));
    }
    if booking.capacity > MAX_PARTICIPANTS {
        return Err(StoreError::LimitExceeded("capacity too large"));
    }
    if booking.participants.len() > booking.capacity as usize {
        return Err(StoreError::Invalid("more participants than capacity"));
    }
    if booking.managers.len() > MAX_MANAGERS {
        return Err(StoreError::LimitExceeded("too many managers"));
    }
    let too_long = |(name, phone): (&String, &String)| {
        name.len() > MAX_NAME_LEN || phone.len() > MAX_PHONE_LEN
    };
    if booking.participants.iter().any(too_long) || booking.managers.iter().any(too_long) {
        return Err(StoreError::LimitExceeded("participant or manager entry too long"));
    }
    if booking.participants.keys().any(|name| name.is_empty()) {
        return Err(StoreError::Invalid("participant name is empty"));
    }
    Ok(())
}

/// Reject `candidate` if any other non-cancelled booking of the schedule overlaps it.
pub(crate) fn check_no_overlap(sb: &ScheduleBookings, candidate: &Booking) -> Result<(), StoreError> {
    match sb
        .overlapping(&candidate.span)
        .find(|b| b.id != candidate.id && b.blocks_time())
    {
        Some(existing) => Err(StoreError::Overlap(existing.id)),
        None => Ok(()),
    }
}
