use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use tokio::time::Instant;
use ulid::Ulid;

use slotd::clock::ManualClock;
use slotd::coordinator::{CoordinatorSettings, ReservationCoordinator};
use slotd::directory::*;
use slotd::error::BookingError;
use slotd::flow::{FlowEngine, FlowSettings, SearchRequest, SearchSlots, Services};
use slotd::gate::AdmissionGate;
use slotd::model::*;
use slotd::store::Store;
use slotd::token::SlotTokenCodec;

// ── Test infrastructure ──────────────────────────────────────

/// 2024-01-01T00:00Z, a Monday.
const MONDAY: Ms = 1_704_067_200_000;
const HOUR: Ms = 3_600_000;

/// Booking lookups for one schedule either fail or hang; the rest pass through.
struct Flaky {
    inner: Arc<Store>,
    broken: ScheduleKey,
    hang: bool,
}

#[async_trait]
impl BookingService for Flaky {
    async fn search(&self, filter: &BookingFilter, limit: usize, offset: usize) -> Result<Page<Booking>, BookingError> {
        if filter.key == Some(self.broken) {
            if self.hang {
                std::future::pending::<()>().await;
            }
            return Err(BookingError::internal("booking service unavailable"));
        }
        self.inner.search(filter, limit, offset).await
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Booking, BookingError> {
        self.inner.get_by_id(id).await
    }

    async fn create(&self, booking: Booking) -> Result<Booking, BookingError> {
        self.inner.create(booking).await
    }
}

struct World {
    businesses: Arc<MemoryBusinesses>,
    schedules: Arc<MemorySchedules>,
    store: Arc<Store>,
    clock: Arc<ManualClock>,
}

fn world() -> World {
    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock = Arc::new(ManualClock::new(MONDAY));
    World {
        businesses: Arc::new(MemoryBusinesses::new()),
        schedules: Arc::new(MemorySchedules::new()),
        store: Arc::new(Store::open(dir.join("search.wal"), clock.clone()).unwrap()),
        clock,
    }
}

fn engine(w: &World, bookings: Arc<dyn BookingService>, gate: AdmissionGate, branch_timeout: Duration) -> FlowEngine {
    let services = Services {
        businesses: w.businesses.clone(),
        schedules: w.schedules.clone(),
        bookings,
        gate,
        codec: Arc::new(SlotTokenCodec::ephemeral()),
        coordinator: Arc::new(ReservationCoordinator::new(
            w.store.clone(),
            w.clock.clone(),
            CoordinatorSettings::default(),
        )),
        settings: FlowSettings {
            branch_timeout,
            ..FlowSettings::default()
        },
    };
    FlowEngine::new(Arc::new(services))
}

/// Three schedules in Vienna: one per business, all open 09:00-17:00 UTC.
async fn three_schedules(w: &World) -> Vec<Schedule> {
    let mut out = Vec::new();
    for name in ["Alpha", "Beta", "Gamma"] {
        let business = w
            .businesses
            .create(Business {
                id: Ulid::new(),
                name: name.into(),
                city: "Vienna".into(),
                category: Some("physio".into()),
            })
            .await
            .unwrap();
        let schedule = w
            .schedules
            .create(Schedule {
                id: Ulid::new(),
                business_id: business.id,
                start_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_of_day: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                working_days: WeekdaySet::MON_FRI,
                meeting_duration_ms: HOUR / 2,
                break_duration_ms: 0,
                max_participants: 1,
                timezone: chrono_tz::Tz::UTC,
                exceptions: vec![],
            })
            .await
            .unwrap();
        out.push(schedule);
    }
    out
}

fn request() -> SearchRequest {
    SearchRequest {
        cities: vec!["Vienna".into()],
        category: None,
        window: Span::new(MONDAY, MONDAY + 24 * HOUR),
        businesses_per_city: 10,
        slots_per_schedule: 5,
        max_results: 100,
    }
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(10)
}

fn schedules_in(engine: &FlowEngine, slots: &[OpenSlot]) -> Vec<ScheduleKey> {
    let mut keys: Vec<ScheduleKey> = slots
        .iter()
        .map(|s| engine.services().codec.decode_key(&s.token).unwrap())
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

// ── Partial results ──────────────────────────────────────────

#[tokio::test]
async fn failing_booking_lookup_drops_only_that_schedule() {
    let w = world();
    let schedules = three_schedules(&w).await;
    let flaky = Arc::new(Flaky {
        inner: w.store.clone(),
        broken: schedules[1].key(),
        hang: false,
    });
    let engine = engine(&w, flaky, AdmissionGate::default(), Duration::from_secs(2));

    let out = engine.run::<SearchSlots>(request(), deadline()).await.unwrap();
    assert_eq!(out.failed_branches, 1);

    let mut expected = vec![schedules[0].key(), schedules[2].key()];
    expected.sort();
    assert_eq!(schedules_in(&engine, &out.slots), expected);
}

#[tokio::test]
async fn slow_booking_lookup_times_out_without_failing_search() {
    let w = world();
    let schedules = three_schedules(&w).await;
    let flaky = Arc::new(Flaky {
        inner: w.store.clone(),
        broken: schedules[0].key(),
        hang: true,
    });
    let engine = engine(&w, flaky, AdmissionGate::new(1), Duration::from_millis(100));

    let out = engine.run::<SearchSlots>(request(), deadline()).await.unwrap();
    assert_eq!(out.failed_branches, 1);
    assert_eq!(schedules_in(&engine, &out.slots).len(), 2);
    assert_eq!(engine.services().gate.in_flight(), 0);
}

#[tokio::test]
async fn caller_deadline_shorter_than_branch_timeout_still_returns_partial_results() {
    let w = world();
    let schedules = three_schedules(&w).await;
    let flaky = Arc::new(Flaky {
        inner: w.store.clone(),
        broken: schedules[2].key(),
        hang: true,
    });
    let settings = FlowSettings::default();
    let engine = engine(&w, flaky, AdmissionGate::default(), settings.branch_timeout);

    let deadline = Instant::now() + Duration::from_secs(1);
    assert!(settings.branch_timeout > Duration::from_secs(1));
    let out = engine.run::<SearchSlots>(request(), deadline).await.unwrap();
    assert_eq!(out.failed_branches, 1);

    let mut expected = vec![schedules[0].key(), schedules[1].key()];
    expected.sort();
    assert_eq!(schedules_in(&engine, &out.slots), expected);
}

// ── Bookings shape the result ────────────────────────────────

#[tokio::test]
async fn fully_booked_schedule_offers_nothing() {
    let w = world();
    let schedules = three_schedules(&w).await;
    w.store
        .insert_booking(Booking {
            id: Ulid::new(),
            key: schedules[0].key(),
            span: Span::new(MONDAY + 9 * HOUR, MONDAY + 17 * HOUR),
            capacity: 1,
            participants: BTreeMap::new(),
            status: BookingStatus::Confirmed,
            managers: BTreeMap::new(),
            created_at: MONDAY,
        })
        .await
        .unwrap();
    let engine = engine(&w, w.store.clone(), AdmissionGate::default(), Duration::from_secs(2));

    let out = engine.run::<SearchSlots>(request(), deadline()).await.unwrap();
    assert_eq!(out.failed_branches, 0);
    let keys = schedules_in(&engine, &out.slots);
    assert_eq!(keys.len(), 2);
    assert!(!keys.contains(&schedules[0].key()));
    for slot in &out.slots {
        assert_eq!(slot.span, Span::new(MONDAY + 9 * HOUR, MONDAY + 17 * HOUR));
    }
}

#[tokio::test]
async fn weekend_window_is_empty_for_weekday_schedules() {
    let w = world();
    three_schedules(&w).await;
    let engine = engine(&w, w.store.clone(), AdmissionGate::default(), Duration::from_secs(2));

    let saturday = MONDAY + 5 * 24 * HOUR;
    let mut req = request();
    req.window = Span::new(saturday, saturday + 24 * HOUR);
    let out = engine.run::<SearchSlots>(req, deadline()).await.unwrap();
    assert!(out.slots.is_empty());
}
