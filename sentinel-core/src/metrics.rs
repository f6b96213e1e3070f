//! Metrics sink abstraction.
//!
//! Components report hit/miss/contention/conflict events through a
//! [`MetricsSink`]; the API crate provides a Prometheus implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Every counter a SENTINEL component may bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    CacheHit,
    CacheMiss,
    CacheSet,
    CacheDelete,
    LockAcquired,
    LockContention,
    LockReleased,
    LockNotOwner,
    IdempotencyCreated,
    IdempotencyReplay,
    IdempotencyConflict,
    IdempotencyInFlight,
    DlqRetried,
    DlqRecovered,
    DlqArchived,
}

impl Counter {
    pub const ALL: [Counter; 15] = [
        Counter::CacheHit,
        Counter::CacheMiss,
        Counter::CacheSet,
        Counter::CacheDelete,
        Counter::LockAcquired,
        Counter::LockContention,
        Counter::LockReleased,
        Counter::LockNotOwner,
        Counter::IdempotencyCreated,
        Counter::IdempotencyReplay,
        Counter::IdempotencyConflict,
        Counter::IdempotencyInFlight,
        Counter::DlqRetried,
        Counter::DlqRecovered,
        Counter::DlqArchived,
    ];

    /// (component, outcome) label pair.
    pub fn labels(&self) -> (&'static str, &'static str) {
        match self {
            Counter::CacheHit => ("cache", "hit"),
            Counter::CacheMiss => ("cache", "miss"),
            Counter::CacheSet => ("cache", "set"),
            Counter::CacheDelete => ("cache", "delete"),
            Counter::LockAcquired => ("lock", "acquired"),
            Counter::LockContention => ("lock", "contention"),
            Counter::LockReleased => ("lock", "released"),
            Counter::LockNotOwner => ("lock", "not_owner"),
            Counter::IdempotencyCreated => ("idempotency", "created"),
            Counter::IdempotencyReplay => ("idempotency", "replay"),
            Counter::IdempotencyConflict => ("idempotency", "conflict"),
            Counter::IdempotencyInFlight => ("idempotency", "in_flight"),
            Counter::DlqRetried => ("dlq", "retried"),
            Counter::DlqRecovered => ("dlq", "recovered"),
            Counter::DlqArchived => ("dlq", "archived"),
        }
    }
}

/// Destination for operational counters.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn record(&self, counter: Counter);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _counter: Counter) {}
}

/// Keeps counts in memory; handy for tests and local inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    counts: Arc<Mutex<HashMap<Counter, u64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&counter)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, counter: Counter) {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(counter)
            .or_insert(0) += 1;
    }
}

/// Shared metrics handle.
pub type SharedMetrics = Arc<dyn MetricsSink>;
