use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::coordinator::ReservationCoordinator;
use crate::directory::{BusinessService, ScheduleService};
use crate::error::BookingError;
use crate::flow::{
    CreateBooking, FlowEngine, FlowError, FlowId, ReserveRequest, SearchRequest, SearchResponse, SearchSlots,
    Services,
};
use crate::gate::AdmissionGate;
use crate::limits::MAX_BUSINESSES_PER_CITY;
use crate::model::*;
use crate::observability::{SEARCH_DURATION_SECONDS, init_metrics};
use crate::reaper;
use crate::store::Store;
use crate::token::SlotTokenCodec;

#[derive(Debug)]
pub enum NodeError {
    Io(io::Error),
    Metrics(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Io(e) => write!(f, "storage: {e}"),
            NodeError::Metrics(e) => write!(f, "metrics exporter: {e}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<io::Error> for NodeError {
    fn from(e: io::Error) -> Self {
        NodeError::Io(e)
    }
}

/// One running instance: the booking store with its background tasks, and
/// the flow engine wired to the given directories.
pub struct Node {
    config: Config,
    store: Arc<Store>,
    engine: FlowEngine,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub async fn start(
        config: Config,
        businesses: Arc<dyn BusinessService>,
        schedules: Arc<dyn ScheduleService>,
    ) -> Result<Self, NodeError> {
        Self::start_with_clock(config, businesses, schedules, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(
        config: Config,
        businesses: Arc<dyn BusinessService>,
        schedules: Arc<dyn ScheduleService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NodeError> {
        init_metrics(config.metrics_port).map_err(|e| NodeError::Metrics(e.to_string()))?;

        tokio::fs::create_dir_all(&config.data_dir).await?;
        let store = Arc::new(Store::open(config.data_dir.join("bookings.wal"), clock.clone())?);

        let coordinator = ReservationCoordinator::new(store.clone(), clock, config.coordinator_settings());
        let services = Services {
            businesses,
            schedules,
            bookings: store.clone(),
            gate: AdmissionGate::new(config.admission_limit),
            codec: Arc::new(SlotTokenCodec::new(&config.token_key)),
            coordinator: Arc::new(coordinator),
            settings: config.flow_settings(),
        };

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(reaper::run_lock_reaper(
                store.clone(),
                config.reaper_interval,
                shutdown.child_token(),
            )),
            tokio::spawn(reaper::run_compactor(
                store.clone(),
                config.compact_threshold,
                config.reaper_interval,
                shutdown.child_token(),
            )),
        ];

        info!(
            data_dir = %config.data_dir.display(),
            admission_limit = config.admission_limit,
            bookings = store.booking_count(),
            "node started"
        );

        Ok(Self {
            config,
            store,
            engine: FlowEngine::new(Arc::new(services)),
            shutdown,
            tasks,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    /// A request over `cities` and `window` with the configured caps.
    pub fn search_request(&self, cities: Vec<String>, window: Span) -> SearchRequest {
        SearchRequest {
            cities,
            category: None,
            window,
            businesses_per_city: MAX_BUSINESSES_PER_CITY,
            slots_per_schedule: self.config.slots_per_schedule,
            max_results: self.config.max_search_results,
        }
    }

    pub async fn search(&self, request: SearchRequest, deadline: Instant) -> Result<SearchResponse, FlowError> {
        let started = std::time::Instant::now();
        let result = self.engine.run::<SearchSlots>(request, deadline).await;
        metrics::histogram!(SEARCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    pub async fn reserve(&self, request: ReserveRequest, deadline: Instant) -> Result<Booking, FlowError> {
        self.engine
            .run::<CreateBooking>(request, deadline)
            .await?
            .ok_or_else(|| FlowError {
                flow: FlowId::CreateBooking,
                step: "reserve",
                source: BookingError::internal("flow finished without a booking"),
            })
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, BookingError> {
        Ok(self.store.cancel_booking(id).await?)
    }

    /// Stop the background tasks and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("node stopped");
    }
}
