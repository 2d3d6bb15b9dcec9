//! Step-sequenced orchestration.
//!
//! A [`Flow`] is a typed, ordered list of named steps over a shared
//! [`Context`]. [`FlowEngine::run`] executes them in order under the caller's
//! deadline and stops at the first failure, reporting which step failed.
//! Concurrency inside a step is the step's business, normally through
//! [`fan_out`] and the admission gate.

pub mod reserve;
pub mod search;

pub use reserve::{CreateBooking, ReserveRequest};
pub use search::{SearchRequest, SearchResponse, SearchSlots};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, debug, info_span, warn};

use crate::coordinator::ReservationCoordinator;
use crate::directory::{BookingService, BusinessService, ScheduleService};
use crate::error::BookingError;
use crate::gate::AdmissionGate;
use crate::token::SlotTokenCodec;

/// Closed set of flows the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowId {
    SearchSlots,
    CreateBooking,
}

impl FlowId {
    pub const ALL: [FlowId; 2] = [FlowId::SearchSlots, FlowId::CreateBooking];

    pub fn name(self) -> &'static str {
        match self {
            FlowId::SearchSlots => "search_slots",
            FlowId::CreateBooking => "create_booking",
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type StepFuture<'a> = BoxFuture<'a, Result<(), BookingError>>;
pub type StepFn<F> = for<'a> fn(&'a mut Context<F>) -> StepFuture<'a>;

pub struct Step<F: Flow> {
    pub name: &'static str,
    pub run: StepFn<F>,
}

impl<F: Flow> Step<F> {
    pub const fn new(name: &'static str, run: StepFn<F>) -> Self {
        Self { name, run }
    }
}

pub trait Flow: Sized + 'static {
    const ID: FlowId;
    type Input: Send + Sync;
    /// Scratch space steps use to hand results to later steps.
    type Process: Default + Send;
    type Output: Default + Send;

    fn steps() -> Vec<Step<Self>>;
}

/// Tunables the flows read from their context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSettings {
    /// Budget for one fan-out branch (one city, one business, one schedule).
    pub branch_timeout: Duration,
    pub schedules_per_business: usize,
    /// Page size when loading a schedule's bookings.
    pub bookings_page_size: usize,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            branch_timeout: Duration::from_secs(3),
            schedules_per_business: 20,
            bookings_page_size: 500,
        }
    }
}

/// Collaborators every flow may reach through its context.
pub struct Services {
    pub businesses: Arc<dyn BusinessService>,
    pub schedules: Arc<dyn ScheduleService>,
    pub bookings: Arc<dyn BookingService>,
    pub gate: AdmissionGate,
    pub codec: Arc<SlotTokenCodec>,
    pub coordinator: Arc<ReservationCoordinator>,
    pub settings: FlowSettings,
}

pub struct Context<F: Flow> {
    input: F::Input,
    pub process: F::Process,
    pub output: F::Output,
    services: Arc<Services>,
    span: tracing::Span,
    deadline: Instant,
}

impl<F: Flow> Context<F> {
    pub fn input(&self) -> &F::Input {
        &self.input
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Span of the running flow; steps log inside it.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// A flow stopped at `step` because of `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
    pub flow: FlowId,
    pub step: &'static str,
    pub source: BookingError,
}

impl FlowError {
    pub fn kind(&self) -> &BookingError {
        &self.source
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed at step {}: {}", self.flow, self.step, self.source)
    }
}

impl std::error::Error for FlowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<FlowError> for BookingError {
    fn from(e: FlowError) -> Self {
        e.source
    }
}

pub struct FlowEngine {
    services: Arc<Services>,
}

impl FlowEngine {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Step names of a registered flow, in execution order.
    pub fn steps_of(id: FlowId) -> Vec<&'static str> {
        fn names<F: Flow>() -> Vec<&'static str> {
            F::steps().iter().map(|s| s.name).collect()
        }
        match id {
            FlowId::SearchSlots => names::<SearchSlots>(),
            FlowId::CreateBooking => names::<CreateBooking>(),
        }
    }

    pub async fn run<F: Flow>(&self, input: F::Input, deadline: Instant) -> Result<F::Output, FlowError> {
        let span = info_span!("flow", flow = F::ID.name());
        let mut ctx = Context::<F> {
            input,
            process: F::Process::default(),
            output: F::Output::default(),
            services: self.services.clone(),
            span: span.clone(),
            deadline,
        };

        for step in F::steps() {
            let fail = |source| FlowError {
                flow: F::ID,
                step: step.name,
                source,
            };
            if Instant::now() >= deadline {
                return Err(fail(BookingError::Timeout));
            }
            let step_span = info_span!(parent: &span, "step", step = step.name);
            match timeout_at(deadline, (step.run)(&mut ctx)).instrument(step_span).await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    span.in_scope(|| debug!(step = step.name, error = %source, "flow stopped"));
                    return Err(fail(source));
                }
                Err(_) => return Err(fail(BookingError::Timeout)),
            }
        }
        Ok(ctx.output)
    }
}

/// Results of a [`fan_out`], in input order, minus the branches that failed.
#[derive(Debug)]
pub struct FanOut<R> {
    pub results: Vec<R>,
    pub failed: usize,
}

/// Aborts outstanding branches if the step running the fan-out is dropped.
struct Branches(Vec<JoinHandle<()>>);

impl Drop for Branches {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Time left for the calling step after the branches are cut off.
const DEADLINE_HEADROOM: Duration = Duration::from_millis(50);

/// Run `work` for every item concurrently, each branch admitted through
/// `gate` and bounded by `branch_timeout`. Outcomes travel over a channel to a
/// single collector task. A branch that errors, times out or panics is logged,
/// counted under `stage`, and left out.
///
/// Branches are also cut off a little before the caller's `deadline`, so the
/// step gets the partial results instead of timing out as a whole.
pub async fn fan_out<T, R, Fut>(
    gate: &AdmissionGate,
    stage: &'static str,
    items: Vec<T>,
    branch_timeout: Duration,
    deadline: Instant,
    work: impl Fn(T) -> Fut,
) -> FanOut<R>
where
    T: Send + 'static,
    R: Send + 'static,
    Fut: Future<Output = Result<R, BookingError>> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return FanOut {
            results: Vec::new(),
            failed: 0,
        };
    }

    let (tx, mut rx) = mpsc::channel::<(usize, Option<R>)>(total);
    let collector = tokio::spawn(async move {
        let mut results = Vec::with_capacity(total);
        let mut reported = 0;
        while let Some((index, outcome)) = rx.recv().await {
            match outcome {
                Some(r) => results.push((index, r)),
                None => reported += 1,
            }
        }
        results.sort_by_key(|(index, _)| *index);
        (results, reported)
    });

    let cutoff = deadline.checked_sub(DEADLINE_HEADROOM).unwrap_or(deadline);
    let until = (Instant::now() + branch_timeout).min(cutoff);
    let mut branches = Branches(Vec::with_capacity(total));
    for (index, item) in items.into_iter().enumerate() {
        let gate = gate.clone();
        let tx = tx.clone();
        let branch = work(item);
        branches.0.push(tokio::spawn(async move {
            let admitted = gate.with_admission(timeout_at(until, branch));
            let outcome = match timeout_at(cutoff, admitted).await {
                Ok(Ok(Ok(r))) => Some(r),
                Ok(Ok(Err(e))) => {
                    warn!(stage, index, error = %e, "fan-out branch failed; excluding it");
                    None
                }
                Ok(Err(_)) | Err(_) => {
                    warn!(stage, index, "fan-out branch timed out; excluding it");
                    None
                }
            };
            let _ = tx.send((index, outcome)).await;
        }));
    }
    drop(tx);

    let (results, reported) = collector.await.unwrap_or_else(|e| {
        warn!(stage, error = %e, "fan-out collector failed");
        (Vec::new(), 0)
    });
    branches.0.clear();

    let panicked = total - results.len() - reported;
    if panicked > 0 {
        warn!(stage, panicked, "fan-out branches panicked; excluding them");
    }
    let failed = total - results.len();
    if failed > 0 {
        metrics::counter!(crate::observability::SEARCH_BRANCH_FAILURES_TOTAL, "stage" => stage)
            .increment(failed as u64);
    }
    FanOut {
        results: results.into_iter().map(|(_, r)| r).collect(),
        failed,
    }
}
