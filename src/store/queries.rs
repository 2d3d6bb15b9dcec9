use async_trait::async_trait;
use ulid::Ulid;

use crate::directory::{BookingFilter, BookingService, Page, check_page};
use crate::error::BookingError;
use crate::model::*;

use super::Store;

impl Store {
    /// Non-cancelled bookings of `key` overlapping `window`, by start time.
    pub async fn active_bookings(&self, key: ScheduleKey, window: Span) -> Vec<Booking> {
        let Some(shared) = self.schedule(&key) else {
            return Vec::new();
        };
        let guard = shared.read().await;
        guard
            .overlapping(&window)
            .filter(|b| b.blocks_time())
            .cloned()
            .collect()
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let key = *self.booking_index.get(&id)?.value();
        let shared = self.schedule(&key)?;
        let guard = shared.read().await;
        guard.bookings.iter().find(|b| b.id == id).cloned()
    }

    /// Bookings matching `filter`, ordered by schedule then start.
    pub async fn find_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let shared: Vec<_> = match filter.key {
            Some(key) => self.schedule(&key).into_iter().collect(),
            None => {
                let mut all: Vec<_> = self
                    .schedules
                    .iter()
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect();
                all.sort_by_key(|(key, _)| *key);
                all.into_iter().map(|(_, sb)| sb).collect()
            }
        };

        let mut hits = Vec::new();
        for sb in shared {
            let guard = sb.read().await;
            match filter.window {
                Some(window) => hits.extend(guard.overlapping(&window).filter(|b| filter.matches(b)).cloned()),
                None => hits.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned()),
            }
        }
        hits
    }

    pub fn booking_count(&self) -> usize {
        self.booking_index.len()
    }
}

#[async_trait]
impl BookingService for Store {
    async fn search(&self, filter: &BookingFilter, limit: usize, offset: usize) -> Result<Page<Booking>, BookingError> {
        check_page(limit)?;
        Ok(Page::slice(self.find_bookings(filter).await, limit, offset))
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Booking, BookingError> {
        self.get_booking(id)
            .await
            .ok_or_else(|| BookingError::NotFound(format!("booking {id}")))
    }

    async fn create(&self, booking: Booking) -> Result<Booking, BookingError> {
        Ok(self.insert_booking(booking).await?)
    }
}
