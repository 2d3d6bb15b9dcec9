use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;

use crate::model::*;
use crate::token::SlotToken;

// ── Availability Computer ─────────────────────────────────────────
//
// Pure: no I/O, no clock. Identical inputs always give identical outputs.

/// The recurring daily rule a schedule publishes.
#[derive(Debug, Clone, Copy)]
pub struct WorkingHours<'a> {
    pub start_of_day: NaiveTime,
    pub end_of_day: NaiveTime,
    pub working_days: WeekdaySet,
    pub timezone: Tz,
    /// Local dates on which nothing is offered.
    pub exceptions: &'a [NaiveDate],
}

impl<'a> From<&'a Schedule> for WorkingHours<'a> {
    fn from(s: &'a Schedule) -> Self {
        Self {
            start_of_day: s.start_of_day,
            end_of_day: s.end_of_day,
            working_days: s.working_days,
            timezone: s.timezone,
            exceptions: &s.exceptions,
        }
    }
}

impl WorkingHours<'_> {
    pub fn is_overnight(&self) -> bool {
        self.end_of_day <= self.start_of_day
    }
}

/// Open slots inside `view`, chronological, at most `limit` of them.
///
/// 1. Walk the bookings (any order) with a cursor to find the free gaps of `view`.
/// 2. Intersect every gap with the working-hours window of the gap's local
///    date and of the following date.
/// 3. Keep pieces that start on a working weekday outside the exceptions and
///    last at least `min_duration_ms`.
pub fn open_slots(
    view: &Span,
    hours: &WorkingHours<'_>,
    min_duration_ms: Ms,
    bookings: &[Span],
    limit: usize,
) -> Vec<Span> {
    let mut slots = Vec::new();
    if limit == 0 {
        return slots;
    }

    for gap in free_gaps(view, bookings) {
        for window in day_windows(hours, gap.start) {
            let Some(candidate) = gap.intersect(&window) else {
                continue;
            };
            if !admits(hours, &candidate, min_duration_ms) {
                continue;
            }
            slots.push(candidate);
            if slots.len() == limit {
                return slots;
            }
        }
    }
    slots
}

/// Attach a schedule's token to each computed slot.
pub fn tag(slots: Vec<Span>, token: &SlotToken) -> Vec<OpenSlot> {
    slots
        .into_iter()
        .map(|span| OpenSlot {
            span,
            token: token.clone(),
        })
        .collect()
}

/// Free intervals of `view` not covered by any booking, clipped to `view`.
pub fn free_gaps(view: &Span, bookings: &[Span]) -> Vec<Span> {
    let mut sorted = bookings.to_vec();
    sorted.sort_by_key(|s| s.start);

    let mut gaps = Vec::new();
    let mut cursor = view.start;
    for booking in &sorted {
        if booking.start > cursor
            && let Some(gap) = Span::try_new(cursor, booking.start).and_then(|g| g.intersect(view))
        {
            gaps.push(gap);
        }
        cursor = cursor.max(booking.end);
    }
    if let Some(tail) = Span::try_new(cursor, view.end) {
        gaps.push(tail);
    }
    gaps
}

/// Working-hours windows of the local date containing `at` and of the next
/// local date. Overnight schedules end on the date after they open.
pub fn day_windows(hours: &WorkingHours<'_>, at: Ms) -> Vec<Span> {
    let Some(utc) = DateTime::from_timestamp_millis(at) else {
        return Vec::new();
    };
    let today = utc.with_timezone(&hours.timezone).date_naive();
    [Some(today), today.succ_opt()]
        .into_iter()
        .flatten()
        .filter_map(|date| window_on(hours, date))
        .collect()
}

fn window_on(hours: &WorkingHours<'_>, date: NaiveDate) -> Option<Span> {
    let start = local_instant(hours.timezone, date, hours.start_of_day)?;
    let end_date = if hours.is_overnight() {
        date.succ_opt()?
    } else {
        date
    };
    let end = local_instant(hours.timezone, end_date, hours.end_of_day)?;
    Span::try_new(start, end)
}

/// Resolve a local wall-clock time to an instant. Ambiguous times (DST fall
/// back) take the earlier instant; nonexistent ones (spring forward) move one
/// hour later.
fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<Ms> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
        .map(|t| t.timestamp_millis())
}

fn admits(hours: &WorkingHours<'_>, candidate: &Span, min_duration_ms: Ms) -> bool {
    if candidate.duration_ms() < min_duration_ms {
        return false;
    }
    let Some(utc) = DateTime::from_timestamp_millis(candidate.start) else {
        return false;
    };
    let local = utc.with_timezone(&hours.timezone);
    hours.working_days.contains(local.weekday()) && !hours.exceptions.contains(&local.date_naive())
}
