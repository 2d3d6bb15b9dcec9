//! Narrow contracts for the business, schedule and booking data services the
//! core consumes. Every service answers `search(filter, limit, offset)` with a
//! page and a total count, `get_by_id`, and `create`.

mod memory;

pub use memory::{MemoryBusinesses, MemorySchedules};

use async_trait::async_trait;
use serde::Serialize;
use ulid::Ulid;

use crate::error::BookingError;
use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub records: Vec<T>,
    /// Matches before `limit`/`offset` were applied.
    pub total: usize,
}

impl<T> Page<T> {
    /// Slice an already-filtered, already-ordered result set.
    pub fn slice(all: Vec<T>, limit: usize, offset: usize) -> Self {
        let total = all.len();
        let records = all.into_iter().skip(offset).take(limit).collect();
        Self { records, total }
    }
}

pub(crate) fn check_page(limit: usize) -> Result<(), BookingError> {
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(BookingError::invalid(format!(
            "page limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusinessFilter {
    pub city: Option<String>,
    pub category: Option<String>,
}

impl BusinessFilter {
    pub fn matches(&self, b: &Business) -> bool {
        self.city.as_ref().is_none_or(|c| b.city.eq_ignore_ascii_case(c))
            && self
                .category
                .as_ref()
                .is_none_or(|c| b.category.as_ref().is_some_and(|bc| bc.eq_ignore_ascii_case(c)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleFilter {
    pub business_id: Option<Ulid>,
}

impl ScheduleFilter {
    pub fn matches(&self, s: &Schedule) -> bool {
        self.business_id.is_none_or(|id| s.business_id == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub key: Option<ScheduleKey>,
    /// Only bookings overlapping this window.
    pub window: Option<Span>,
    /// Skip cancelled bookings.
    pub active_only: bool,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.key.is_none_or(|k| b.key == k)
            && self.window.is_none_or(|w| b.span.overlaps(&w))
            && (!self.active_only || b.blocks_time())
    }
}

#[async_trait]
pub trait BusinessService: Send + Sync {
    async fn search(&self, filter: &BusinessFilter, limit: usize, offset: usize) -> Result<Page<Business>, BookingError>;
    async fn get_by_id(&self, id: Ulid) -> Result<Business, BookingError>;
    async fn create(&self, business: Business) -> Result<Business, BookingError>;
}

#[async_trait]
pub trait ScheduleService: Send + Sync {
    async fn search(&self, filter: &ScheduleFilter, limit: usize, offset: usize) -> Result<Page<Schedule>, BookingError>;
    async fn get_by_id(&self, id: Ulid) -> Result<Schedule, BookingError>;
    async fn create(&self, schedule: Schedule) -> Result<Schedule, BookingError>;
}

#[async_trait]
pub trait BookingService: Send + Sync {
    async fn search(&self, filter: &BookingFilter, limit: usize, offset: usize) -> Result<Page<Booking>, BookingError>;
    async fn get_by_id(&self, id: Ulid) -> Result<Booking, BookingError>;
    /// Inserts only if no non-cancelled booking of the schedule overlaps.
    async fn create(&self, booking: Booking) -> Result<Booking, BookingError>;
}
