use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::actors::{MissionBus, MissionBusConfig, MissionBusError};
use crate::dispatch::{JobDispatcher, WorkerPool, WorkerPoolConfig};
use crate::events::{EventLogConfig, RunEventLog};
use crate::limits::{AdmissionPolicy, QuotaEnforcer, RateLimiter};
use crate::observability::RunMetrics;
use crate::run::{CancellationRegistry, RunDriver, RunExecutor, RunStore};

/// Rate-limit buckets idle this long are dropped by the retention sweep.
const RATE_BUCKET_IDLE: Duration = Duration::from_secs(60 * 60);

/// Tunables for the whole pipeline
#[derive(Debug, Clone, Default)]
pub struct StackConfig {
    pub workers: WorkerPoolConfig,
    pub event_log: EventLogConfig,
    pub mission: MissionBusConfig,
    pub admission: AdmissionPolicy,
}

/// Everything a request handler or worker needs, constructed once at startup
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub events: RunEventLog,
    pub mission: MissionBus,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub driver: Arc<RunDriver>,
    pub cancellations: CancellationRegistry,
    pub rate_limiter: RateLimiter,
    pub quotas: QuotaEnforcer,
    pub metrics: RunMetrics,
    pub admission: AdmissionPolicy,
    worker_pool: Option<Arc<WorkerPool>>,
}

/// Pieces for [`AppState::from_parts`], for callers that bring their own
/// dispatcher.
pub struct AppStateParts {
    pub store: Arc<dyn RunStore>,
    pub executor: Arc<dyn RunExecutor>,
    pub mission: MissionBus,
    pub event_log: EventLogConfig,
    pub admission: AdmissionPolicy,
}

impl AppState {
    /// Spawn the mission bus on the current runtime and the worker pool on
    /// `worker_runtime`.
    pub async fn start(
        config: StackConfig,
        store: Arc<dyn RunStore>,
        executor: Arc<dyn RunExecutor>,
        worker_runtime: &Handle,
    ) -> Result<Self, MissionBusError> {
        let (mission, _) = MissionBus::spawn(config.mission.clone()).await?;
        let mut worker_pool = None;
        let mut state = Self::from_parts(
            AppStateParts {
                store,
                executor,
                mission,
                event_log: config.event_log.clone(),
                admission: config.admission,
            },
            |driver| {
                let pool = Arc::new(WorkerPool::start(
                    worker_runtime,
                    config.workers.clone(),
                    driver,
                ));
                worker_pool = Some(Arc::clone(&pool));
                pool as Arc<dyn JobDispatcher>
            },
        );
        state.worker_pool = worker_pool;
        Ok(state)
    }

    /// Build the state around an externally supplied dispatcher. The
    /// closure receives the driver so the dispatcher can execute runs.
    pub fn from_parts(
        parts: AppStateParts,
        dispatcher: impl FnOnce(Arc<RunDriver>) -> Arc<dyn JobDispatcher>,
    ) -> Self {
        let events = RunEventLog::new(parts.event_log);
        let cancellations = CancellationRegistry::new();
        let metrics = RunMetrics::new();
        let driver = Arc::new(RunDriver::new(
            Arc::clone(&parts.store),
            events.clone(),
            parts.mission.clone(),
            parts.executor,
            cancellations.clone(),
            metrics.clone(),
        ));
        let dispatcher = dispatcher(Arc::clone(&driver));

        Self {
            store: parts.store,
            events,
            mission: parts.mission,
            dispatcher,
            driver,
            cancellations,
            rate_limiter: RateLimiter::new(),
            quotas: QuotaEnforcer::new(),
            metrics,
            admission: parts.admission,
            worker_pool: None,
        }
    }

    /// Periodically drop retained state nobody can observe any more.
    pub fn spawn_retention_sweep(
        self: &Arc<Self>,
        retention: Duration,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pruned_logs = state.events.prune_finished(retention);
                let purged_counters = state.quotas.purge_expired(chrono::Utc::now());
                let evicted_buckets = state.rate_limiter.evict_idle(RATE_BUCKET_IDLE);
                if pruned_logs > 0 || purged_counters > 0 || evicted_buckets > 0 {
                    tracing::debug!(pruned_logs, purged_counters, evicted_buckets, "Retention sweep");
                }
            }
        })
    }

    /// Drain the worker pool and stop the mission bus.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.worker_pool {
            pool.shutdown().await;
        }
        self.mission.stop();
    }
}
