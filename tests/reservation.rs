use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use ulid::Ulid;

use slotd::clock::ManualClock;
use slotd::coordinator::{CoordinatorSettings, ReservationCoordinator, ReservationRequest};
use slotd::error::{BookingError, ConflictReason};
use slotd::model::*;
use slotd::store::{BookingStore, Store};

// ── Test infrastructure ──────────────────────────────────────

const BASE: Ms = 1_700_000_000_000;
const HOUR: Ms = 3_600_000;

fn setup(name: &str) -> (Arc<Store>, Arc<ManualClock>, Arc<ReservationCoordinator>) {
    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock = Arc::new(ManualClock::new(BASE));
    let store = Arc::new(Store::open(dir.join(name), clock.clone()).unwrap());
    let coordinator = Arc::new(ReservationCoordinator::new(
        store.clone(),
        clock.clone(),
        CoordinatorSettings::default(),
    ));
    (store, clock, coordinator)
}

fn schedule_key() -> ScheduleKey {
    ScheduleKey {
        business_id: Ulid::new(),
        schedule_id: Ulid::new(),
    }
}

fn request(key: ScheduleKey, start: Ms, end: Ms, who: &str) -> ReservationRequest {
    ReservationRequest {
        key,
        span: Span::new(start, end),
        capacity: 1,
        participants: BTreeMap::from([(who.to_string(), "+44 20".to_string())]),
        managers: BTreeMap::new(),
    }
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

// ── Races ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_attempts_on_one_slot_yield_one_booking() {
    let (store, _, coordinator) = setup("race.wal");
    let key = schedule_key();

    let mut handles = Vec::new();
    for i in 0..32 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .reserve(request(key, BASE, BASE + HOUR, &format!("guest-{i}")), deadline())
                .await
        }));
    }

    let mut created = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => created += 1,
            Err(BookingError::Conflict(_)) => {}
            Err(other) => panic!("unexpected outcome: {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(store.active_bookings(key, Span::new(BASE, BASE + HOUR)).await.len(), 1);
    assert_eq!(store.lock_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn staggered_overlapping_attempts_never_double_book() {
    let (store, _, coordinator) = setup("staggered.wal");
    let key = schedule_key();

    // Different starts mean different locks; only the store's check guards them.
    let mut handles = Vec::new();
    for i in 0..16 {
        let coordinator = coordinator.clone();
        let start = BASE + i * 5 * 60_000;
        handles.push(tokio::spawn(async move {
            coordinator
                .reserve(request(key, start, start + HOUR, "guest"), deadline())
                .await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    let booked = store
        .active_bookings(key, Span::new(BASE, BASE + 3 * HOUR))
        .await;
    assert!(!booked.is_empty());
    for (i, a) in booked.iter().enumerate() {
        for b in &booked[i + 1..] {
            assert!(!a.span.overlaps(&b.span), "{:?} overlaps {:?}", a.span, b.span);
        }
    }
}

#[tokio::test]
async fn different_schedules_do_not_contend() {
    let (_, _, coordinator) = setup("independent.wal");
    let (a, b) = (schedule_key(), schedule_key());
    let (x, y) = tokio::join!(
        coordinator.reserve(request(a, BASE, BASE + HOUR, "ann"), deadline()),
        coordinator.reserve(request(b, BASE, BASE + HOUR, "bob"), deadline()),
    );
    assert!(x.is_ok());
    assert!(y.is_ok());
}

#[tokio::test]
async fn late_attempt_is_either_booked_or_cleanly_timed_out() {
    let (store, _, coordinator) = setup("late.wal");
    let key = schedule_key();

    let late = Instant::now() - Duration::from_millis(50);
    let outcome = coordinator
        .reserve(request(key, BASE, BASE + HOUR, "ivy"), late)
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = store.active_bookings(key, Span::new(BASE, BASE + HOUR)).await;

    match outcome {
        Ok(booking) => assert_eq!(stored, vec![booking]),
        Err(BookingError::Timeout) => {
            assert!(stored.is_empty());
            let retry = coordinator
                .reserve(request(key, BASE, BASE + HOUR, "ivy"), deadline())
                .await;
            assert!(retry.is_ok(), "retry after timeout refused: {retry:?}");
        }
        Err(other) => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(store.lock_count(), 0);
}

// ── Lock expiry ──────────────────────────────────────────────

#[tokio::test]
async fn crashed_holder_blocks_until_ttl_elapses() {
    let (store, clock, coordinator) = setup("crash.wal");
    let key = schedule_key();
    let slot = LockKey::new(key, BASE);

    // A holder that acquired the lock and then vanished.
    store
        .try_lock(slot, Ulid::new(), Duration::from_secs(10))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(9));
    let refused = coordinator
        .reserve(request(key, BASE, BASE + HOUR, "eve"), deadline())
        .await;
    assert_eq!(
        refused.unwrap_err(),
        BookingError::Conflict(ConflictReason::SlotBeingClaimed(slot))
    );

    clock.advance(Duration::from_secs(1));
    let booking = coordinator
        .reserve(request(key, BASE, BASE + HOUR, "eve"), deadline())
        .await
        .unwrap();
    assert_eq!(booking.span, Span::new(BASE, BASE + HOUR));
    assert_eq!(store.lock_count(), 0);
}

// ── Durability ───────────────────────────────────────────────

#[tokio::test]
async fn bookings_survive_reopen() {
    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("reopen.wal");
    let clock = Arc::new(ManualClock::new(BASE));
    let key = schedule_key();

    let booking = {
        let store = Arc::new(Store::open(path.clone(), clock.clone()).unwrap());
        let coordinator = ReservationCoordinator::new(store, clock.clone(), CoordinatorSettings::default());
        coordinator
            .reserve(request(key, BASE, BASE + HOUR, "kim"), deadline())
            .await
            .unwrap()
    };

    let store = Arc::new(Store::open(path, clock.clone()).unwrap());
    assert_eq!(store.get_booking(booking.id).await, Some(booking));

    let coordinator = ReservationCoordinator::new(store, clock, CoordinatorSettings::default());
    let err = coordinator
        .reserve(request(key, BASE + HOUR / 2, BASE + 2 * HOUR, "lou"), deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Conflict(ConflictReason::Overlap(_))));
}
