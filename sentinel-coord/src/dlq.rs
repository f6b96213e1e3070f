//! Dead-letter queue and bounded retry sweeper.
//!
//! Failed asynchronous operations land in a [`DeadLetterQueue`]. A
//! [`DlqSweeper`] periodically re-dispatches the ones that are due:
//!
//! - success removes the item
//! - failure bumps `retry_count` and schedules the next attempt with backoff
//! - a failure that brings `retry_count` to `max_retries` archives the item
//!   and removes it
//!
//! Counting the original failure, an item is dispatched at most
//! `max_retries + 1` times in total.
//!
//! Every attempt, whether from a sweep or from `retry_now`, first takes a
//! short lease on `dlq:{id}` through the [`LockManager`]. Two attempts on the
//! same item therefore never overlap, and an item is archived only by the
//! attempt that actually removed it from the queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use sentinel_core::constants::DLQ_CLAIM_PREFIX;
use sentinel_core::{
    expiry_after, new_entity_id, CoordinationError, Counter, DlqSettings, EntityId, FailedEvent,
    NoopMetrics, SentinelResult, SharedClock, SharedMetrics, Timestamp,
};

use crate::lock::{AcquireOutcome, LockManager};

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Re-executes a dead-lettered operation.
#[async_trait]
pub trait Dispatcher: Send + Sync + fmt::Debug {
    /// Dispatch `event` again. `Err` carries the failure description.
    async fn dispatch(&self, event: &FailedEvent) -> Result<(), String>;
}

/// Receives items that exhausted their retries.
///
/// Archival is best-effort: a failing sink is logged, the item is still
/// dropped from the active queue.
#[async_trait]
pub trait ArchiveSink: Send + Sync + fmt::Debug {
    async fn archive(&self, event: &FailedEvent, reason: &str) -> SentinelResult<()>;
}

/// Archives by logging at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingArchive;

#[async_trait]
impl ArchiveSink for TracingArchive {
    async fn archive(&self, event: &FailedEvent, reason: &str) -> SentinelResult<()> {
        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempts = event.total_attempts(),
            first_failed_at = %event.first_failed_at,
            last_error = %event.last_error,
            reason,
            "Dead-letter item archived"
        );
        Ok(())
    }
}

/// Keeps archived items in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    items: Arc<Mutex<Vec<FailedEvent>>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived(&self) -> Vec<FailedEvent> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchive {
    async fn archive(&self, event: &FailedEvent, _reason: &str) -> SentinelResult<()> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// Active dead-letter items keyed by id.
#[derive(Debug)]
pub struct DeadLetterQueue {
    items: DashMap<EntityId, FailedEvent>,
    clock: SharedClock,
}

impl DeadLetterQueue {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            items: DashMap::new(),
            clock,
        }
    }

    /// Dead-letter an operation that just failed. Due for retry immediately.
    pub fn enqueue(
        &self,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        error: impl Into<String>,
    ) -> FailedEvent {
        let event = FailedEvent::new(event_type, payload, error, self.clock.now());
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            error = %event.last_error,
            "Operation dead-lettered"
        );
        self.items.insert(event.id, event.clone());
        event
    }

    /// Insert an item as-is, replacing any item with the same id.
    pub fn push(&self, event: FailedEvent) {
        self.items.insert(event.id, event);
    }

    pub fn get(&self, id: EntityId) -> Option<FailedEvent> {
        self.items.get(&id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items, soonest retry first.
    pub fn list(&self) -> Vec<FailedEvent> {
        let mut items: Vec<FailedEvent> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by_key(|e| (e.next_retry_at, e.id));
        items
    }

    /// Up to `limit` items due at `now`, soonest first.
    pub fn due(&self, now: Timestamp, limit: usize) -> Vec<FailedEvent> {
        let mut due: Vec<FailedEvent> = self
            .items
            .iter()
            .filter(|e| e.value().is_due(now))
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|e| (e.next_retry_at, e.id));
        due.truncate(limit);
        due
    }

    pub fn remove(&self, id: EntityId) -> Option<FailedEvent> {
        self.items.remove(&id).map(|(_, e)| e)
    }

    /// Replace an item that is still queued. Returns `false` if it is gone.
    fn update(&self, event: FailedEvent) -> bool {
        match self.items.get_mut(&event.id) {
            Some(mut slot) => {
                *slot = event;
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Sweeper counters since startup.
#[derive(Debug, Default)]
pub struct DlqSweeperMetrics {
    pub sweeps: AtomicU64,
    pub attempted: AtomicU64,
    pub recovered: AtomicU64,
    pub rescheduled: AtomicU64,
    pub archived: AtomicU64,
    /// Items skipped because another attempt held the claim
    pub skipped: AtomicU64,
    pub errors: AtomicU64,
}

impl DlqSweeperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> DlqSweeperSnapshot {
        DlqSweeperSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            attempted: self.attempted.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweeper metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlqSweeperSnapshot {
    pub sweeps: u64,
    pub attempted: u64,
    pub recovered: u64,
    pub rescheduled: u64,
    pub archived: u64,
    pub skipped: u64,
    pub errors: u64,
}

// ============================================================================
// SWEEPER
// ============================================================================

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Recovered,
    Rescheduled {
        retry_count: u32,
        next_retry_at: Timestamp,
    },
    Archived {
        attempts: u32,
        /// Whether this call dispatched before archiving
        dispatched: bool,
    },
    /// Claimed by a concurrent attempt, already gone, or not yet due
    Skipped,
}

/// Totals for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub recovered: usize,
    pub rescheduled: usize,
    pub archived: usize,
    pub skipped: usize,
}

impl SweepReport {
    fn tally(&mut self, outcome: &RetryOutcome) {
        match outcome {
            RetryOutcome::Recovered => {
                self.attempted += 1;
                self.recovered += 1;
            }
            RetryOutcome::Rescheduled { .. } => {
                self.attempted += 1;
                self.rescheduled += 1;
            }
            RetryOutcome::Archived { dispatched, .. } => {
                self.attempted += usize::from(*dispatched);
                self.archived += 1;
            }
            RetryOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Bounded-retry processor for a [`DeadLetterQueue`].
#[derive(Debug, Clone)]
pub struct DlqSweeper {
    queue: Arc<DeadLetterQueue>,
    dispatcher: Arc<dyn Dispatcher>,
    archive: Arc<dyn ArchiveSink>,
    locks: LockManager,
    clock: SharedClock,
    settings: DlqSettings,
    metrics: SharedMetrics,
    counters: Arc<DlqSweeperMetrics>,
    instance_id: EntityId,
}

impl DlqSweeper {
    pub fn new(
        queue: Arc<DeadLetterQueue>,
        dispatcher: Arc<dyn Dispatcher>,
        locks: LockManager,
        clock: SharedClock,
        settings: DlqSettings,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            archive: Arc::new(TracingArchive),
            locks,
            clock,
            settings,
            metrics: Arc::new(NoopMetrics),
            counters: Arc::new(DlqSweeperMetrics::new()),
            instance_id: new_entity_id(),
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveSink>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn queue(&self) -> &Arc<DeadLetterQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &DlqSettings {
        &self.settings
    }

    /// Counters accumulated by this sweeper and its clones.
    pub fn metrics(&self) -> &Arc<DlqSweeperMetrics> {
        &self.counters
    }

    /// Process up to `batch_size` due items.
    pub async fn sweep_once(&self) -> SweepReport {
        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        let due = self.queue.due(self.clock.now(), self.settings.batch_size);
        let mut report = SweepReport::default();

        for event in due {
            match self.attempt(event.id, false).await {
                Ok(outcome) => report.tally(&outcome),
                Err(e) => {
                    tracing::error!(error = %e, event_id = %event.id, "Dead-letter retry failed");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if report.attempted > 0 || report.archived > 0 {
            tracing::info!(
                attempted = report.attempted,
                recovered = report.recovered,
                rescheduled = report.rescheduled,
                archived = report.archived,
                skipped = report.skipped,
                "Dead-letter sweep completed"
            );
        } else {
            tracing::trace!("Dead-letter sweep found nothing due");
        }
        report
    }

    /// Retry one item now, ignoring its schedule.
    ///
    /// Returns `Skipped` if a sweep or another manual retry holds the item.
    pub async fn retry_now(&self, id: EntityId) -> SentinelResult<RetryOutcome> {
        self.attempt(id, true).await
    }

    async fn attempt(&self, id: EntityId, force: bool) -> SentinelResult<RetryOutcome> {
        let claim_key = format!("{}{}", DLQ_CLAIM_PREFIX, id);
        // Unique per attempt so that two attempts from one sweeper still exclude each other
        let claimant = format!("{}:{}", self.instance_id, new_entity_id());

        if let AcquireOutcome::Busy { holder, .. } = self
            .locks
            .acquire(&claim_key, &claimant, self.settings.claim_ttl)
            .await?
        {
            tracing::debug!(event_id = %id, holder = %holder, "Dead-letter item claimed elsewhere");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(RetryOutcome::Skipped);
        }

        let result = self.attempt_claimed(id, force).await;

        if let Err(e) = self.locks.release(&claim_key, &claimant).await {
            tracing::warn!(error = %e, event_id = %id, "Failed to release dead-letter claim");
        }
        result
    }

    async fn attempt_claimed(&self, id: EntityId, force: bool) -> SentinelResult<RetryOutcome> {
        let now = self.clock.now();
        let Some(event) = self.queue.get(id) else {
            return Ok(RetryOutcome::Skipped);
        };
        if !force && !event.is_due(now) {
            return Ok(RetryOutcome::Skipped);
        }
        if event.retry_count >= self.settings.max_retries {
            return Ok(self.archive_item(event, false).await);
        }

        self.metrics.record(Counter::DlqRetried);
        self.counters.attempted.fetch_add(1, Ordering::Relaxed);

        match self.dispatcher.dispatch(&event).await {
            Ok(()) => {
                self.queue.remove(id);
                self.metrics.record(Counter::DlqRecovered);
                self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    event_id = %id,
                    event_type = %event.event_type,
                    attempts = event.total_attempts() + 1,
                    "Dead-letter item recovered"
                );
                Ok(RetryOutcome::Recovered)
            }
            Err(error) => {
                let mut failed = event;
                failed.retry_count = failed.retry_count.saturating_add(1);
                failed.last_error = error;

                if failed.retry_count >= self.settings.max_retries {
                    return Ok(self.archive_item(failed, true).await);
                }

                let delay = self
                    .settings
                    .backoff
                    .delay_for(failed.retry_count.saturating_sub(1));
                failed.next_retry_at = expiry_after(self.clock.now(), delay);
                let retry_count = failed.retry_count;
                let next_retry_at = failed.next_retry_at;

                if !self.queue.update(failed) {
                    return Ok(RetryOutcome::Skipped);
                }
                self.counters.rescheduled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event_id = %id,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    "Dead-letter retry failed, rescheduled"
                );
                Ok(RetryOutcome::Rescheduled {
                    retry_count,
                    next_retry_at,
                })
            }
        }
    }

    /// Remove and archive. Only the caller that removed the item archives it.
    async fn archive_item(&self, event: FailedEvent, dispatched: bool) -> RetryOutcome {
        if self.queue.remove(event.id).is_none() {
            return RetryOutcome::Skipped;
        }

        let attempts = event.total_attempts();
        let reason = CoordinationError::Exhausted {
            id: event.id,
            attempts,
        }
        .to_string();
        if let Err(e) = self.archive.archive(&event, &reason).await {
            tracing::error!(error = %e, event_id = %event.id, "Archive sink rejected item");
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }

        self.metrics.record(Counter::DlqArchived);
        self.counters.archived.fetch_add(1, Ordering::Relaxed);
        RetryOutcome::Archived {
            attempts,
            dispatched,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
