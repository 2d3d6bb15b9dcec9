use std::collections::BTreeMap;

use crate::coordinator::ReservationRequest;
use crate::directory::ScheduleService;
use crate::error::BookingError;
use crate::model::*;
use crate::token::SlotToken;

use super::{Context, Flow, FlowId, Step, StepFuture};

/// Book a slot previously returned by a search.
pub struct CreateBooking;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Token of the slot's schedule, as returned by a search.
    pub token: SlotToken,
    pub span: Span,
    pub capacity: u32,
    pub participants: BTreeMap<String, String>,
    pub managers: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct ReserveProcess {
    key: Option<ScheduleKey>,
    schedule: Option<Schedule>,
}

impl Flow for CreateBooking {
    const ID: FlowId = FlowId::CreateBooking;
    type Input = ReserveRequest;
    type Process = ReserveProcess;
    type Output = Option<Booking>;

    fn steps() -> Vec<Step<Self>> {
        vec![
            Step::new("decode_token", decode_token),
            Step::new("load_schedule", load_schedule),
            Step::new("validate", validate),
            Step::new("reserve", reserve),
        ]
    }
}

fn decode_token(ctx: &mut Context<CreateBooking>) -> StepFuture<'_> {
    Box::pin(async move {
        let key = ctx.services().codec.decode_key(&ctx.input().token)?;
        ctx.process.key = Some(key);
        Ok(())
    })
}

fn load_schedule(ctx: &mut Context<CreateBooking>) -> StepFuture<'_> {
    Box::pin(async move {
        let key = ctx
            .process
            .key
            .ok_or_else(|| BookingError::internal("slot token was not decoded"))?;
        let schedules = ctx.services().schedules.clone();
        let schedule = schedules.get_by_id(key.schedule_id).await?;
        if schedule.business_id != key.business_id {
            return Err(BookingError::invalid("schedule does not belong to the token's business"));
        }
        ctx.process.schedule = Some(schedule);
        Ok(())
    })
}

fn validate(ctx: &mut Context<CreateBooking>) -> StepFuture<'_> {
    Box::pin(async move {
        let schedule = ctx
            .process
            .schedule
            .as_ref()
            .ok_or_else(|| BookingError::internal("schedule was not loaded"))?;
        let req = ctx.input();
        if req.span.end <= req.span.start {
            return Err(BookingError::invalid("slot end must be after its start"));
        }
        if req.capacity > schedule.max_participants {
            return Err(BookingError::invalid(format!(
                "capacity {} exceeds the schedule's limit of {}",
                req.capacity, schedule.max_participants
            )));
        }
        if req.participants.len() > req.capacity as usize {
            return Err(BookingError::invalid("more participants than capacity"));
        }
        Ok(())
    })
}

fn reserve(ctx: &mut Context<CreateBooking>) -> StepFuture<'_> {
    Box::pin(async move {
        let Some(schedule) = &ctx.process.schedule else {
            return Err(BookingError::internal("schedule was not loaded"));
        };
        let req = ctx.input();
        let request = ReservationRequest {
            key: schedule.key(),
            span: req.span,
            capacity: req.capacity,
            participants: req.participants.clone(),
            managers: req.managers.clone(),
        };
        let coordinator = ctx.services().coordinator.clone();
        let booking = coordinator.reserve(request, ctx.deadline()).await?;
        ctx.output = Some(booking);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::coordinator::{CoordinatorSettings, ReservationCoordinator};
    use crate::directory::{MemoryBusinesses, MemorySchedules};
    use crate::error::ConflictReason;
    use crate::flow::{FlowEngine, FlowSettings, Services};
    use crate::gate::AdmissionGate;
    use crate::store::Store;
    use crate::token::{KEY_LEN, SlotTokenCodec};
    use chrono::NaiveTime;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;
    use ulid::Ulid;

    const BASE: Ms = 1_700_000_000_000;
    const H: Ms = 3_600_000;

    fn engine(name: &str) -> (FlowEngine, Arc<MemorySchedules>, Arc<Store>) {
        let dir = std::env::temp_dir().join("slotd_test_reserve");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);

        let clock = Arc::new(ManualClock::new(BASE));
        let store = Arc::new(Store::open(path, clock.clone()).unwrap());
        let schedules = Arc::new(MemorySchedules::new());
        let services = Services {
            businesses: Arc::new(MemoryBusinesses::new()),
            schedules: schedules.clone(),
            bookings: store.clone(),
            gate: AdmissionGate::new(4),
            codec: Arc::new(SlotTokenCodec::new(&[9u8; KEY_LEN])),
            coordinator: Arc::new(ReservationCoordinator::new(
                store.clone(),
                clock,
                CoordinatorSettings::default(),
            )),
            settings: FlowSettings::default(),
        };
        (FlowEngine::new(Arc::new(services)), schedules, store)
    }

    async fn schedule(schedules: &MemorySchedules) -> Schedule {
        schedules
            .create(Schedule {
                id: Ulid::new(),
                business_id: Ulid::new(),
                start_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_of_day: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                working_days: WeekdaySet::ALL,
                meeting_duration_ms: H,
                break_duration_ms: 0,
                max_participants: 3,
                timezone: chrono_tz::Tz::UTC,
                exceptions: vec![],
            })
            .await
            .unwrap()
    }

    fn request(token: SlotToken, start: Ms) -> ReserveRequest {
        ReserveRequest {
            token,
            span: Span::new(start, start + H),
            capacity: 2,
            participants: BTreeMap::from([("Ada".into(), "+351 900".into())]),
            managers: BTreeMap::new(),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn books_the_tokens_schedule() {
        let (engine, schedules, store) = engine("reserve_ok.wal");
        let s = schedule(&schedules).await;
        let token = engine.services().codec.encode_key(s.key()).unwrap();

        let booking = engine
            .run::<CreateBooking>(request(token, BASE), deadline())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(booking.key, s.key());
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(store.get_booking(booking.id).await, Some(booking));
    }

    #[tokio::test]
    async fn second_booking_of_the_slot_conflicts() {
        let (engine, schedules, _store) = engine("reserve_conflict.wal");
        let s = schedule(&schedules).await;
        let token = engine.services().codec.encode_key(s.key()).unwrap();

        engine.run::<CreateBooking>(request(token.clone(), BASE), deadline()).await.unwrap();
        let err = engine
            .run::<CreateBooking>(request(token, BASE + H / 2), deadline())
            .await
            .unwrap_err();
        assert_eq!(err.step, "reserve");
        assert!(matches!(err.kind(), BookingError::Conflict(ConflictReason::Overlap(_))));
    }

    #[tokio::test]
    async fn tampered_token_is_invalid_input() {
        let (engine, schedules, store) = engine("reserve_tampered.wal");
        let s = schedule(&schedules).await;
        let token = engine.services().codec.encode_key(s.key()).unwrap();
        let mut forged = token.as_str().to_string();
        let last = if forged.ends_with('A') { 'B' } else { 'A' };
        forged.pop();
        forged.push(last);

        let err = engine
            .run::<CreateBooking>(request(SlotToken::from(forged), BASE), deadline())
            .await
            .unwrap_err();
        assert_eq!(err.step, "decode_token");
        assert_eq!(err.kind().label(), "invalid_input");
        assert_eq!(store.booking_count(), 0);
    }

    #[tokio::test]
    async fn token_for_an_unknown_schedule_is_not_found() {
        let (engine, _schedules, _store) = engine("reserve_unknown.wal");
        let key = ScheduleKey {
            business_id: Ulid::new(),
            schedule_id: Ulid::new(),
        };
        let token = engine.services().codec.encode_key(key).unwrap();
        let err = engine.run::<CreateBooking>(request(token, BASE), deadline()).await.unwrap_err();
        assert_eq!(err.step, "load_schedule");
        assert_eq!(err.kind().label(), "not_found");
    }

    #[tokio::test]
    async fn token_naming_another_business_is_rejected() {
        let (engine, schedules, _store) = engine("reserve_mismatch.wal");
        let s = schedule(&schedules).await;
        let key = ScheduleKey {
            business_id: Ulid::new(),
            schedule_id: s.id,
        };
        let token = engine.services().codec.encode_key(key).unwrap();
        let err = engine.run::<CreateBooking>(request(token, BASE), deadline()).await.unwrap_err();
        assert_eq!(err.step, "load_schedule");
        assert_eq!(err.kind().label(), "invalid_input");
    }

    #[tokio::test]
    async fn capacity_above_schedule_limit_is_rejected() {
        let (engine, schedules, store) = engine("reserve_capacity.wal");
        let s = schedule(&schedules).await;
        let token = engine.services().codec.encode_key(s.key()).unwrap();
        let mut req = request(token, BASE);
        req.capacity = 4;

        let err = engine.run::<CreateBooking>(req, deadline()).await.unwrap_err();
        assert_eq!(err.step, "validate");
        assert_eq!(store.lock_count(), 0);
        assert_eq!(store.booking_count(), 0);
    }
}
