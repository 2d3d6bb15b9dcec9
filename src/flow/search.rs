use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::availability::{WorkingHours, open_slots, tag};
use crate::directory::{BookingFilter, BookingService, BusinessFilter, ScheduleFilter};
use crate::error::BookingError;
use crate::limits::*;
use crate::model::*;

use super::{Context, Flow, FlowId, Step, StepFuture, fan_out};

/// Find open slots across every business of the given cities.
pub struct SearchSlots;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub cities: Vec<String>,
    pub category: Option<String>,
    /// At most 24 hours wide.
    pub window: Span,
    pub businesses_per_city: usize,
    pub slots_per_schedule: usize,
    pub max_results: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchResponse {
    /// Ordered by start, then schedule.
    pub slots: Vec<OpenSlot>,
    /// Fan-out branches (cities, businesses, schedules) left out after failing.
    pub failed_branches: usize,
}

#[derive(Debug, Default)]
pub struct SearchProcess {
    businesses: Vec<Business>,
    schedules: Vec<Schedule>,
    /// Only schedules whose bookings loaded completely.
    booked: Vec<(Schedule, Vec<Span>)>,
    failed_branches: usize,
}

impl Flow for SearchSlots {
    const ID: FlowId = FlowId::SearchSlots;
    type Input = SearchRequest;
    type Process = SearchProcess;
    type Output = SearchResponse;

    fn steps() -> Vec<Step<Self>> {
        vec![
            Step::new("validate", validate),
            Step::new("find_businesses", find_businesses),
            Step::new("load_schedules", load_schedules),
            Step::new("load_bookings", load_bookings),
            Step::new("compute_slots", compute_slots),
        ]
    }
}

fn validate(ctx: &mut Context<SearchSlots>) -> StepFuture<'_> {
    Box::pin(async move {
        let req = ctx.input();
        if req.cities.is_empty() {
            return Err(BookingError::invalid("at least one city is required"));
        }
        if req.cities.len() > MAX_CITIES_PER_SEARCH {
            return Err(BookingError::invalid(format!(
                "at most {MAX_CITIES_PER_SEARCH} cities per search"
            )));
        }
        if req.cities.iter().any(|c| c.trim().is_empty()) {
            return Err(BookingError::invalid("city names must not be blank"));
        }
        if req.window.end <= req.window.start {
            return Err(BookingError::invalid("search window is empty"));
        }
        if req.window.duration_ms() > MAX_SEARCH_WINDOW_MS {
            return Err(BookingError::invalid("search window is wider than 24 hours"));
        }
        if !(1..=MAX_BUSINESSES_PER_CITY).contains(&req.businesses_per_city) {
            return Err(BookingError::invalid(format!(
                "businesses per city must be 1..={MAX_BUSINESSES_PER_CITY}"
            )));
        }
        if !(1..=MAX_SLOTS_PER_SCHEDULE).contains(&req.slots_per_schedule) {
            return Err(BookingError::invalid(format!(
                "slots per schedule must be 1..={MAX_SLOTS_PER_SCHEDULE}"
            )));
        }
        if !(1..=MAX_SEARCH_RESULTS).contains(&req.max_results) {
            return Err(BookingError::invalid(format!(
                "max results must be 1..={MAX_SEARCH_RESULTS}"
            )));
        }
        Ok(())
    })
}

fn find_businesses(ctx: &mut Context<SearchSlots>) -> StepFuture<'_> {
    Box::pin(async move {
        let services = ctx.services().clone();
        let req = ctx.input();

        let mut seen = HashSet::new();
        let cities: Vec<String> = req
            .cities
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| seen.insert(c.to_lowercase()))
            .collect();

        let directory = services.businesses.clone();
        let category = req.category.clone();
        let limit = req.businesses_per_city;
        let found = fan_out(
            &services.gate,
            "find_businesses",
            cities,
            services.settings.branch_timeout,
            ctx.deadline(),
            move |city| {
                let directory = directory.clone();
                let filter = BusinessFilter {
                    city: Some(city),
                    category: category.clone(),
                };
                async move { Ok(directory.search(&filter, limit, 0).await?.records) }
            },
        )
        .await;

        let mut ids = HashSet::new();
        let businesses: Vec<Business> = found
            .results
            .into_iter()
            .flatten()
            .filter(|b| ids.insert(b.id))
            .collect();
        debug!(businesses = businesses.len(), failed = found.failed, "businesses found");

        ctx.process.businesses = businesses;
        ctx.process.failed_branches += found.failed;
        Ok(())
    })
}

fn load_schedules(ctx: &mut Context<SearchSlots>) -> StepFuture<'_> {
    Box::pin(async move {
        let services = ctx.services().clone();
        let owners: Vec<Ulid> = ctx.process.businesses.iter().map(|b| b.id).collect();

        let directory = services.schedules.clone();
        let limit = services.settings.schedules_per_business;
        let found = fan_out(
            &services.gate,
            "load_schedules",
            owners,
            services.settings.branch_timeout,
            ctx.deadline(),
            move |business_id| {
                let directory = directory.clone();
                async move {
                    let filter = ScheduleFilter {
                        business_id: Some(business_id),
                    };
                    Ok(directory.search(&filter, limit, 0).await?.records)
                }
            },
        )
        .await;

        ctx.process.schedules = found.results.into_iter().flatten().collect();
        ctx.process.failed_branches += found.failed;
        debug!(schedules = ctx.process.schedules.len(), failed = found.failed, "schedules loaded");
        Ok(())
    })
}

/// Every active booking of `key` overlapping `window`, across pages.
async fn all_bookings(
    bookings: Arc<dyn BookingService>,
    key: ScheduleKey,
    window: Span,
    page_size: usize,
) -> Result<Vec<Span>, BookingError> {
    let filter = BookingFilter {
        key: Some(key),
        window: Some(window),
        active_only: true,
    };
    let mut spans = Vec::new();
    loop {
        let page = bookings.search(&filter, page_size, spans.len()).await?;
        let fetched = page.records.len();
        spans.extend(page.records.into_iter().map(|b| b.span));
        if fetched == 0 || spans.len() >= page.total {
            return Ok(spans);
        }
    }
}

fn load_bookings(ctx: &mut Context<SearchSlots>) -> StepFuture<'_> {
    Box::pin(async move {
        let services = ctx.services().clone();
        let window = ctx.input().window;
        let schedules = std::mem::take(&mut ctx.process.schedules);

        let store = services.bookings.clone();
        let page_size = services.settings.bookings_page_size;
        let found = fan_out(
            &services.gate,
            "load_bookings",
            schedules,
            services.settings.branch_timeout,
            ctx.deadline(),
            move |schedule| {
                let store = store.clone();
                async move {
                    let spans = all_bookings(store, schedule.key(), window, page_size).await?;
                    Ok((schedule, spans))
                }
            },
        )
        .await;

        // A schedule whose lookup failed is dropped, never treated as free.
        ctx.process.booked = found.results;
        ctx.process.failed_branches += found.failed;
        Ok(())
    })
}

fn compute_slots(ctx: &mut Context<SearchSlots>) -> StepFuture<'_> {
    Box::pin(async move {
        let services = ctx.services().clone();
        let req = ctx.input();
        let mut failed = 0;

        let mut ranked: Vec<(Ms, Ulid, OpenSlot)> = Vec::new();
        for (schedule, bookings) in &ctx.process.booked {
            let token = match services.codec.encode_key(schedule.key()) {
                Ok(token) => token,
                Err(e) => {
                    warn!(schedule = %schedule.id, error = %e, "could not issue slot token; skipping schedule");
                    failed += 1;
                    continue;
                }
            };
            let spans = open_slots(
                &req.window,
                &WorkingHours::from(schedule),
                schedule.meeting_duration_ms,
                bookings,
                req.slots_per_schedule,
            );
            ranked.extend(
                tag(spans, &token)
                    .into_iter()
                    .map(|slot| (slot.span.start, schedule.id, slot)),
            );
        }

        ranked.sort_by_key(|(start, schedule_id, _)| (*start, *schedule_id));
        ranked.truncate(req.max_results);

        let failed_branches = ctx.process.failed_branches + failed;
        if failed_branches > 0 {
            warn!(failed_branches, "search returned partial results");
        }
        ctx.output = SearchResponse {
            slots: ranked.into_iter().map(|(_, _, slot)| slot).collect(),
            failed_branches,
        };
        Ok(())
    })
}
