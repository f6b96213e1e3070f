//! Shared application state for Axum routers.
//!
//! [`SentinelState`] wires every coordination primitive to one cache backend,
//! one clock and one metrics sink. Handlers extract the piece they need via
//! `FromRef`.

use std::sync::Arc;

use sentinel_core::{SentinelConfig, SentinelError, SharedClock, SharedMetrics, SystemClock};
use sentinel_coord::{
    DeadLetterQueue, Dispatcher, DlqSweeper, IdempotencyCoordinator, LockManager, TracingArchive,
};
use sentinel_storage::{CacheBackend, InMemoryBackend, StatsBackend, TtlCacheStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ApiError, ApiResult};
use crate::jobs::{maintenance_task, MaintenanceConfig, MaintenanceMetrics};
use crate::middleware::IdempotencyState;
use crate::telemetry::{PrometheusMetrics, METRICS};

/// Application-wide state shared across all routes.
#[derive(Debug, Clone)]
pub struct SentinelState {
    pub config: Arc<SentinelConfig>,
    pub clock: SharedClock,
    /// Counting layer over the shared backend; every component goes through it
    pub stats: Arc<StatsBackend>,
    pub cache: TtlCacheStore,
    pub locks: LockManager,
    pub idempotency: IdempotencyCoordinator,
    pub dlq: Arc<DeadLetterQueue>,
    pub metrics: Arc<PrometheusMetrics>,
    /// Flips to `true` on shutdown; interrupts duplicates waiting in the middleware
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl SentinelState {
    /// Build the component graph over an in-memory backend.
    pub fn new(
        config: SentinelConfig,
        clock: SharedClock,
        metrics: Arc<PrometheusMetrics>,
    ) -> ApiResult<Self> {
        config
            .validate()
            .map_err(|e| ApiError::from(SentinelError::from(e)))?;

        let sink: SharedMetrics = metrics.clone();
        let inner: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new(clock.clone()));
        let stats = Arc::new(
            StatsBackend::new(inner, config.stats.max_tracked_keys).with_metrics(sink.clone()),
        );
        let backend: Arc<dyn CacheBackend> = stats.clone();

        let cache = TtlCacheStore::new(backend.clone(), clock.clone(), config.cache.clone());
        let locks = LockManager::new(backend.clone(), clock.clone(), config.locks.clone())
            .with_metrics(sink.clone());
        let idempotency =
            IdempotencyCoordinator::new(backend, clock.clone(), config.idempotency.clone())
                .with_metrics(sink)
                .with_max_key_bytes(config.cache.max_key_bytes);
        let dlq = Arc::new(DeadLetterQueue::new(clock.clone()));

        Ok(Self {
            config: Arc::new(config),
            clock,
            stats,
            cache,
            locks,
            idempotency,
            dlq,
            metrics,
            shutdown: None,
        })
    }

    /// Share the server's shutdown signal with request-scoped waits.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Configuration from `SENTINEL_*` variables, the system clock and the
    /// process-wide metrics instance.
    pub fn from_env() -> ApiResult<Self> {
        let metrics = METRICS.as_ref().map_err(Clone::clone)?.clone();
        Self::new(SentinelConfig::from_env(), Arc::new(SystemClock), metrics)
    }

    /// A sweeper over this state's queue, archiving through `tracing`.
    pub fn sweeper(&self, dispatcher: Arc<dyn Dispatcher>) -> DlqSweeper {
        DlqSweeper::new(
            self.dlq.clone(),
            dispatcher,
            self.locks.clone(),
            self.clock.clone(),
            self.config.dlq.clone(),
        )
        .with_archive(Arc::new(TracingArchive))
        .with_metrics(self.metrics.clone())
    }

    pub fn idempotency_state(&self) -> IdempotencyState {
        let state = IdempotencyState::new(self.idempotency.clone());
        match &self.shutdown {
            Some(shutdown) => state.with_shutdown(shutdown.clone()),
            None => state,
        }
    }

    /// Spawn the maintenance task for this state.
    pub fn spawn_maintenance(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<Arc<MaintenanceMetrics>> {
        tokio::spawn(maintenance_task(
            self.sweeper(dispatcher),
            self.idempotency.clone(),
            MaintenanceConfig::from(self.config.as_ref()),
            shutdown_rx,
        ))
    }
}

macro_rules! impl_from_ref {
    ($type:ty, $field:ident) => {
        impl axum::extract::FromRef<SentinelState> for $type {
            fn from_ref(state: &SentinelState) -> Self {
                state.$field.clone()
            }
        }
    };
}

impl_from_ref!(TtlCacheStore, cache);
impl_from_ref!(LockManager, locks);
impl_from_ref!(IdempotencyCoordinator, idempotency);
impl_from_ref!(Arc<DeadLetterQueue>, dlq);
impl_from_ref!(Arc<PrometheusMetrics>, metrics);

impl axum::extract::FromRef<SentinelState> for IdempotencyState {
    fn from_ref(state: &SentinelState) -> Self {
        state.idempotency_state()
    }
}
