use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::error::{BookingError, ConflictReason};
use crate::limits::MAX_NAME_LEN;
use crate::model::*;

use super::*;

/// In-process business directory. Results are ordered by id.
#[derive(Debug, Default)]
pub struct MemoryBusinesses {
    records: DashMap<Ulid, Business>,
}

impl MemoryBusinesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl BusinessService for MemoryBusinesses {
    async fn search(&self, filter: &BusinessFilter, limit: usize, offset: usize) -> Result<Page<Business>, BookingError> {
        check_page(limit)?;
        let mut hits: Vec<Business> = self
            .records
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|b| b.id);
        Ok(Page::slice(hits, limit, offset))
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Business, BookingError> {
        self.records
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| BookingError::NotFound(format!("business {id}")))
    }

    async fn create(&self, business: Business) -> Result<Business, BookingError> {
        if business.name.is_empty() || business.name.len() > MAX_NAME_LEN {
            return Err(BookingError::invalid("business name must be 1..=256 bytes"));
        }
        if business.city.is_empty() {
            return Err(BookingError::invalid("business city is required"));
        }
        match self.records.entry(business.id) {
            Entry::Occupied(_) => Err(BookingError::Conflict(ConflictReason::Duplicate(business.id))),
            Entry::Vacant(slot) => {
                slot.insert(business.clone());
                Ok(business)
            }
        }
    }
}

/// In-process schedule directory. Results are ordered by id.
#[derive(Debug, Default)]
pub struct MemorySchedules {
    records: DashMap<Ulid, Schedule>,
}

impl MemorySchedules {
    pub fn new() -> Self {
        Self::default()
    }
}

fn validate_schedule(s: &Schedule) -> Result<(), BookingError> {
    if s.meeting_duration_ms <= 0 {
        return Err(BookingError::invalid("meeting duration must be positive"));
    }
    if s.break_duration_ms < 0 {
        return Err(BookingError::invalid("break duration must not be negative"));
    }
    if s.max_participants == 0 {
        return Err(BookingError::invalid("max participants must be at least 1"));
    }
    if s.working_days.is_empty() {
        return Err(BookingError::invalid("schedule has no working days"));
    }
    if s.start_of_day == s.end_of_day {
        return Err(BookingError::invalid("start and end of day must differ"));
    }
    Ok(())
}

#[async_trait]
impl ScheduleService for MemorySchedules {
    async fn search(&self, filter: &ScheduleFilter, limit: usize, offset: usize) -> Result<Page<Schedule>, BookingError> {
        check_page(limit)?;
        let mut hits: Vec<Schedule> = self
            .records
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|s| s.id);
        Ok(Page::slice(hits, limit, offset))
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Schedule, BookingError> {
        self.records
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| BookingError::NotFound(format!("schedule {id}")))
    }

    async fn create(&self, schedule: Schedule) -> Result<Schedule, BookingError> {
        validate_schedule(&schedule)?;
        match self.records.entry(schedule.id) {
            Entry::Occupied(_) => Err(BookingError::Conflict(ConflictReason::Duplicate(schedule.id))),
            Entry::Vacant(slot) => {
                slot.insert(schedule.clone());
                Ok(schedule)
            }
        }
    }
}
