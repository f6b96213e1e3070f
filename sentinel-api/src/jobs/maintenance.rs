//! Maintenance Background Task
//!
//! Periodically does the housekeeping the coordination primitives rely on:
//!
//! - a dead-letter sweep every `dlq.sweep_interval`, re-dispatching due items
//!   and archiving exhausted ones
//! - an idempotency cleanup every `jobs.idempotency_cleanup_interval`,
//!   reclaiming records whose TTL has passed
//!
//! # Configuration
//!
//! ```rust
//! use sentinel_api::jobs::MaintenanceConfig;
//! use sentinel_core::SentinelConfig;
//!
//! let config = MaintenanceConfig::from(&SentinelConfig::development());
//! assert_eq!(config.sweep_interval.as_secs(), 10);
//! ```

use sentinel_core::SentinelConfig;
use sentinel_coord::{DlqSweeper, IdempotencyCoordinator, SweepReport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the maintenance background task.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    /// How often to sweep the dead-letter queue
    pub sweep_interval: Duration,

    /// How often to purge expired idempotency records
    pub idempotency_cleanup_interval: Duration,
}

impl From<&SentinelConfig> for MaintenanceConfig {
    fn from(config: &SentinelConfig) -> Self {
        Self {
            sweep_interval: config.dlq.sweep_interval,
            idempotency_cleanup_interval: config.jobs.idempotency_cleanup_interval,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self::from(&SentinelConfig::default())
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for maintenance operations.
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    /// Dead-letter sweeps run since startup
    pub sweep_cycles: AtomicU64,

    /// Dead-letter items re-dispatched successfully
    pub items_recovered: AtomicU64,

    /// Dead-letter items that failed again and were rescheduled
    pub items_rescheduled: AtomicU64,

    /// Dead-letter items archived after exhausting their retries
    pub items_archived: AtomicU64,

    /// Idempotency cleanup passes run since startup
    pub cleanup_cycles: AtomicU64,

    /// Expired idempotency records removed
    pub idempotency_keys_cleaned: AtomicU64,

    /// Errors encountered during cleanup
    pub cleanup_errors: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            items_recovered: self.items_recovered.load(Ordering::Relaxed),
            items_rescheduled: self.items_rescheduled.load(Ordering::Relaxed),
            items_archived: self.items_archived.load(Ordering::Relaxed),
            cleanup_cycles: self.cleanup_cycles.load(Ordering::Relaxed),
            idempotency_keys_cleaned: self.idempotency_keys_cleaned.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
        }
    }

    fn record_sweep(&self, report: &SweepReport) {
        self.sweep_cycles.fetch_add(1, Ordering::Relaxed);
        self.items_recovered
            .fetch_add(report.recovered as u64, Ordering::Relaxed);
        self.items_rescheduled
            .fetch_add(report.rescheduled as u64, Ordering::Relaxed);
        self.items_archived
            .fetch_add(report.archived as u64, Ordering::Relaxed);
    }
}

/// Snapshot of maintenance metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    pub sweep_cycles: u64,
    pub items_recovered: u64,
    pub items_rescheduled: u64,
    pub items_archived: u64,
    pub cleanup_cycles: u64,
    pub idempotency_keys_cleaned: u64,
    pub cleanup_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task running dead-letter sweeps and idempotency cleanup.
///
/// Runs until `shutdown_rx` carries `true` or its sender is dropped, then
/// returns the metrics collected over its lifetime.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(maintenance_task(
///     sweeper,
///     coordinator,
///     MaintenanceConfig::from(&config),
///     shutdown_rx,
/// ));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn maintenance_task(
    sweeper: DlqSweeper,
    coordinator: IdempotencyCoordinator,
    config: MaintenanceConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<MaintenanceMetrics> {
    let metrics = Arc::new(MaintenanceMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut idempotency_interval = interval(config.idempotency_cleanup_interval);
    idempotency_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        idempotency_cleanup_interval_secs = config.idempotency_cleanup_interval.as_secs(),
        "Maintenance task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Maintenance task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                let report = sweeper.sweep_once().await;
                metrics.record_sweep(&report);
            }

            _ = idempotency_interval.tick() => {
                cleanup_idempotency_keys(&coordinator, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweep_cycles = snapshot.sweep_cycles,
        items_recovered = snapshot.items_recovered,
        items_archived = snapshot.items_archived,
        idempotency_keys_cleaned = snapshot.idempotency_keys_cleaned,
        cleanup_errors = snapshot.cleanup_errors,
        "Maintenance task completed"
    );

    metrics
}

/// Remove expired idempotency records.
async fn cleanup_idempotency_keys(
    coordinator: &IdempotencyCoordinator,
    metrics: &MaintenanceMetrics,
) {
    metrics.cleanup_cycles.fetch_add(1, Ordering::Relaxed);

    match coordinator.cleanup_expired().await {
        Ok(count) => {
            if count > 0 {
                metrics
                    .idempotency_keys_cleaned
                    .fetch_add(count, Ordering::Relaxed);
                tracing::info!(count = count, "Cleaned up expired idempotency records");
            } else {
                tracing::trace!("No expired idempotency records to clean up");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to clean up idempotency records");
            metrics.cleanup_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{Fingerprint, SentinelResult};
    use sentinel_coord::MemoryArchive;
    use sentinel_test_utils::fixtures::Harness;
    use sentinel_test_utils::ScriptedDispatcher;

    #[test]
    fn test_config_from_sentinel_config() {
        let config = MaintenanceConfig::from(&SentinelConfig::development());
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
        assert_eq!(config.idempotency_cleanup_interval, Duration::from_secs(60));

        let defaults = MaintenanceConfig::default();
        assert_eq!(defaults.sweep_interval, SentinelConfig::default().dlq.sweep_interval);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = MaintenanceMetrics::new();
        metrics.record_sweep(&SweepReport {
            attempted: 3,
            recovered: 2,
            rescheduled: 1,
            archived: 0,
            skipped: 0,
        });
        metrics.idempotency_keys_cleaned.store(7, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sweep_cycles, 1);
        assert_eq!(snapshot.items_recovered, 2);
        assert_eq!(snapshot.items_rescheduled, 1);
        assert_eq!(snapshot.idempotency_keys_cleaned, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_sweeps_and_cleans_until_shutdown() -> SentinelResult<()> {
        let harness = Harness::new();
        let queue = harness.queue();
        queue.enqueue("order.created", serde_json::json!({ "id": 1 }), "timeout");
        queue.enqueue("order.created", serde_json::json!({ "id": 2 }), "timeout");
        let dispatcher = Arc::new(ScriptedDispatcher::succeeding());
        let sweeper = harness.sweeper(queue.clone(), dispatcher.clone(), MemoryArchive::new());

        let coordinator = harness.coordinator();
        let fp = Fingerprint::from_request("POST", "/orders", None, b"{}");
        coordinator.begin("stale", &fp).await?;
        harness.advance(harness.config.idempotency.default_ttl);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(maintenance_task(
            sweeper,
            coordinator,
            MaintenanceConfig::from(&harness.config),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = shutdown_tx.send(true);
        let metrics = handle.await.expect("maintenance task panicked");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sweep_cycles, 1);
        assert_eq!(snapshot.items_recovered, 2);
        assert_eq!(snapshot.cleanup_cycles, 1);
        assert_eq!(snapshot.idempotency_keys_cleaned, 1);
        assert_eq!(dispatcher.calls(), 2);
        assert!(queue.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_repeats_on_interval() {
        let harness = Harness::new();
        let sweeper = harness.sweeper(
            harness.queue(),
            Arc::new(ScriptedDispatcher::succeeding()),
            MemoryArchive::new(),
        );
        let config = MaintenanceConfig {
            sweep_interval: Duration::from_secs(10),
            idempotency_cleanup_interval: Duration::from_secs(3600),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(maintenance_task(
            sweeper,
            harness.coordinator(),
            config,
            shutdown_rx,
        ));

        // Ticks at 0, 10 and 20 seconds
        tokio::time::sleep(Duration::from_secs(25)).await;
        let _ = shutdown_tx.send(true);
        let metrics = handle.await.expect("maintenance task panicked");

        assert_eq!(metrics.snapshot().sweep_cycles, 3);
        assert_eq!(metrics.snapshot().cleanup_cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_stops_task() {
        let harness = Harness::new();
        let sweeper = harness.sweeper(
            harness.queue(),
            Arc::new(ScriptedDispatcher::succeeding()),
            MemoryArchive::new(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(maintenance_task(
            sweeper,
            harness.coordinator(),
            MaintenanceConfig::default(),
            shutdown_rx,
        ));
        drop(shutdown_tx);

        let metrics = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task did not stop")
            .expect("maintenance task panicked");
        assert!(metrics.snapshot().sweep_cycles <= 1);
    }
}
