use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::token::SlotToken;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` when the interval would be empty.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[s1,e1)` and `[s2,e2)` overlap iff `s1 < e2 && e1 > s2`.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Directory records ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: Ulid,
    pub name: String,
    pub city: String,
    pub category: Option<String>,
}

/// Set of working weekdays, one bit per day starting at Monday.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EMPTY: WeekdaySet = WeekdaySet(0);
    pub const ALL: WeekdaySet = WeekdaySet(0b111_1111);
    pub const MON_FRI: WeekdaySet = WeekdaySet(0b001_1111);

    pub fn of(days: &[Weekday]) -> Self {
        days.iter().fold(Self::EMPTY, |set, d| set.with(*d))
    }

    pub fn with(self, day: Weekday) -> Self {
        Self(self.0 | (1 << day.num_days_from_monday()))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// A business's recurring availability template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub business_id: Ulid,
    /// Local opening time.
    pub start_of_day: NaiveTime,
    /// Local closing time; at or before `start_of_day` means the day wraps past midnight.
    pub end_of_day: NaiveTime,
    pub working_days: WeekdaySet,
    pub meeting_duration_ms: Ms,
    pub break_duration_ms: Ms,
    pub max_participants: u32,
    pub timezone: Tz,
    /// Local dates on which the schedule is closed.
    pub exceptions: Vec<NaiveDate>,
}

impl Schedule {
    pub fn key(&self) -> ScheduleKey {
        ScheduleKey {
            business_id: self.business_id,
            schedule_id: self.id,
        }
    }

    pub fn is_overnight(&self) -> bool {
        self.end_of_day <= self.start_of_day
    }
}

// ── Bookings ─────────────────────────────────────────────────────

/// Identifies the (business, schedule) pair a booking belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleKey {
    pub business_id: Ulid,
    pub schedule_id: Ulid,
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.business_id, self.schedule_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub key: ScheduleKey,
    pub span: Span,
    pub capacity: u32,
    /// Participant name → phone number.
    pub participants: BTreeMap<String, String>,
    pub status: BookingStatus,
    pub managers: BTreeMap<String, String>,
    pub created_at: Ms,
}

impl Booking {
    /// Cancelled bookings no longer occupy their interval.
    pub fn blocks_time(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }
}

/// Bookings of one schedule, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ScheduleBookings {
    pub key: ScheduleKey,
    pub bookings: Vec<Booking>,
}

impl ScheduleBookings {
    pub fn new(key: ScheduleKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (of any status) whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

// ── Advisory locks ───────────────────────────────────────────────

/// Deterministic identity of a reservation attempt on one exact slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub business_id: Ulid,
    pub schedule_id: Ulid,
    pub slot_start: Ms,
}

impl LockKey {
    pub fn new(key: ScheduleKey, slot_start: Ms) -> Self {
        Self {
            business_id: key.business_id,
            schedule_id: key.schedule_id,
            slot_start,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.business_id, self.schedule_id, self.slot_start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingLock {
    pub key: LockKey,
    /// Unique per acquisition; release only succeeds for the current holder.
    pub holder: Ulid,
    pub expires_at: Ms,
}

impl BookingLock {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

/// A computed open window, bound to its schedule by an opaque token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenSlot {
    pub span: Span,
    pub token: SlotToken,
}

// ── WAL records ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated(Booking),
    BookingStatusChanged {
        id: Ulid,
        key: ScheduleKey,
        status: BookingStatus,
    },
}

impl Event {
    pub fn key(&self) -> ScheduleKey {
        match self {
            Event::BookingCreated(b) => b.key,
            Event::BookingStatusChanged { key, .. } => *key,
        }
    }
}
