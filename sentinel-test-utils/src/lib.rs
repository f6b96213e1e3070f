//! SENTINEL Test Utilities
//!
//! Shared test infrastructure for the SENTINEL workspace:
//! - A scripted dispatcher for dead-letter retry tests
//! - A manual-clock harness that wires every component to one backend
//! - Proptest generators for keys, fingerprints, responses and configs
//! - Custom assertions for SENTINEL-specific outcomes

// Re-export core types for convenience
pub use sentinel_core::{
    BackoffStrategy, CacheEntry, Clock, CoordinationError, Counter, EntityId, FailedEvent,
    FailedPolicy, Fingerprint, InMemoryMetrics, ManualClock, SentinelConfig, SentinelError,
    SentinelResult, SharedClock, StoredResponse, Timestamp, ValidationError,
};
pub use sentinel_coord::{
    DeadLetterQueue, Dispatcher, DlqSweeper, Execution, IdempotencyCoordinator, LockManager,
    MemoryArchive, RecordedOutcome,
};
pub use sentinel_storage::{CacheBackend, InMemoryBackend, TtlCacheStore};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

/// Dispatcher that fails a fixed number of times, then succeeds.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    fail_first: u32,
    calls: AtomicU32,
    dispatched: Mutex<Vec<EntityId>>,
}

impl ScriptedDispatcher {
    /// Every dispatch succeeds.
    pub fn succeeding() -> Self {
        Self::failing_first(0)
    }

    /// The first `n` dispatches fail.
    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: n,
            ..Default::default()
        }
    }

    /// Every dispatch fails.
    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids in dispatch order, repeats included.
    pub fn dispatched(&self) -> Vec<EntityId> {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(&self, event: &FailedEvent) -> Result<(), String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.id);
        if call < self.fail_first {
            Err(format!("scripted failure #{}", call + 1))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating SENTINEL inputs.

    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    // === Identity Generators ===

    /// Generate a random entity id.
    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        any::<[u8; 16]>().prop_map(EntityId::from_bytes)
    }

    /// Generate a client-style idempotency key.
    pub fn arb_idempotency_key() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_-]{1,64}"
    }

    /// Generate a tenant identifier.
    pub fn arb_tenant_id() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,16}"
    }

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Generate a TTL between one second and one day.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..86_400).prop_map(Duration::from_secs)
    }

    // === Request Generators ===

    /// Generate a mutating HTTP method.
    pub fn arb_mutating_method() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("POST".to_string()),
            Just("PUT".to_string()),
            Just("PATCH".to_string()),
            Just("DELETE".to_string()),
        ]
    }

    /// Generate a request path.
    pub fn arb_path() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z]{1,8}", 1..4).prop_map(|parts| format!("/{}", parts.join("/")))
    }

    /// Generate a request body.
    pub fn arb_body() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..256)
    }

    /// Generate a fingerprint of a plausible request.
    pub fn arb_fingerprint() -> impl Strategy<Value = Fingerprint> {
        (
            arb_mutating_method(),
            arb_path(),
            proptest::option::of("[a-z]=[0-9]{1,3}"),
            arb_body(),
        )
            .prop_map(|(method, path, query, body)| {
                Fingerprint::from_request(&method, &path, query.as_deref(), &body)
            })
    }

    /// Generate a stored response with a few headers.
    pub fn arb_stored_response() -> impl Strategy<Value = StoredResponse> {
        (
            200u16..600,
            arb_body(),
            prop::collection::vec(("x-[a-z]{1,8}", "[a-z0-9]{0,12}"), 0..4),
        )
            .prop_map(|(status, body, headers)| {
                headers
                    .into_iter()
                    .fold(StoredResponse::new(status, body), |response, (name, value)| {
                        response.with_header(name, value)
                    })
            })
    }

    // === DLQ Generators ===

    /// Generate a backoff strategy.
    pub fn arb_backoff() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            (1u64..600).prop_map(|s| BackoffStrategy::Fixed(Duration::from_secs(s))),
            (1u64..60, 60u64..7200).prop_map(|(initial, max)| BackoffStrategy::Exponential {
                initial: Duration::from_secs(initial),
                max: Duration::from_secs(max),
            }),
        ]
    }

    /// Generate a dead-letter item that has been retried a few times.
    pub fn arb_failed_event() -> impl Strategy<Value = FailedEvent> {
        (
            "[a-z]{3,12}\\.[a-z]{3,12}",
            any::<u32>(),
            "[a-z ]{1,40}",
            arb_timestamp(),
            0u32..10,
        )
            .prop_map(|(event_type, n, error, at, retry_count)| {
                let mut event =
                    FailedEvent::new(event_type, serde_json::json!({ "n": n }), error, at);
                event.retry_count = retry_count;
                event
            })
    }

    // === Config Generators ===

    /// Generate a SentinelConfig that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = SentinelConfig> {
        (
            0u32..10,
            1u64..600,
            1usize..500,
            1u64..3600,
            arb_backoff(),
            any::<bool>(),
        )
            .prop_map(
                |(max_retries, sweep_secs, batch_size, lock_secs, backoff, require_key)| {
                    let mut config = SentinelConfig::default();
                    config.dlq.max_retries = max_retries;
                    config.dlq.sweep_interval = Duration::from_secs(sweep_secs);
                    config.dlq.batch_size = batch_size;
                    config.dlq.backoff = backoff;
                    config.locks.default_ttl = Duration::from_secs(lock_secs);
                    config.idempotency.require_key = require_key;
                    config
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built components sharing one backend and one manual clock.

    use super::*;

    /// Development config with waits short enough for tests.
    pub fn test_config() -> SentinelConfig {
        let mut config = SentinelConfig::development();
        config.idempotency.processing_wait_timeout = Duration::from_millis(200);
        config.idempotency.poll_interval = Duration::from_millis(10);
        config.dlq.backoff = BackoffStrategy::Fixed(Duration::from_secs(10));
        config
    }

    /// Everything a coordination test needs, wired to a [`ManualClock`].
    #[derive(Debug, Clone)]
    pub struct Harness {
        pub clock: ManualClock,
        pub backend: Arc<InMemoryBackend>,
        pub metrics: InMemoryMetrics,
        pub config: SentinelConfig,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(test_config())
        }

        pub fn with_config(config: SentinelConfig) -> Self {
            let clock = ManualClock::starting_now();
            let backend = Arc::new(InMemoryBackend::new(Arc::new(clock.clone())));
            Self {
                clock,
                backend,
                metrics: InMemoryMetrics::new(),
                config,
            }
        }

        pub fn shared_clock(&self) -> SharedClock {
            Arc::new(self.clock.clone())
        }

        pub fn backend(&self) -> Arc<dyn CacheBackend> {
            self.backend.clone()
        }

        pub fn advance(&self, by: Duration) {
            self.clock.advance(by);
        }

        pub fn store(&self) -> TtlCacheStore {
            TtlCacheStore::new(self.backend(), self.shared_clock(), self.config.cache.clone())
        }

        pub fn locks(&self) -> LockManager {
            LockManager::new(self.backend(), self.shared_clock(), self.config.locks.clone())
                .with_metrics(Arc::new(self.metrics.clone()))
        }

        pub fn coordinator(&self) -> IdempotencyCoordinator {
            IdempotencyCoordinator::new(
                self.backend(),
                self.shared_clock(),
                self.config.idempotency.clone(),
            )
            .with_metrics(Arc::new(self.metrics.clone()))
            .with_max_key_bytes(self.config.cache.max_key_bytes)
        }

        pub fn queue(&self) -> Arc<DeadLetterQueue> {
            Arc::new(DeadLetterQueue::new(self.shared_clock()))
        }

        /// A sweeper over `queue` that archives into `archive`.
        pub fn sweeper(
            &self,
            queue: Arc<DeadLetterQueue>,
            dispatcher: Arc<dyn Dispatcher>,
            archive: MemoryArchive,
        ) -> DlqSweeper {
            DlqSweeper::new(
                queue,
                dispatcher,
                self.locks(),
                self.shared_clock(),
                self.config.dlq.clone(),
            )
            .with_archive(Arc::new(archive))
            .with_metrics(Arc::new(self.metrics.clone()))
        }
    }

    impl Default for Harness {
        fn default() -> Self {
            Self::new()
        }
    }

    /// The `201 Created` response an order endpoint would store.
    pub fn created_response(body: &str) -> StoredResponse {
        StoredResponse::new(201, body.as_bytes().to_vec())
            .with_header("content-type", "application/json")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for SENTINEL-specific outcomes.

    use super::*;

    /// Assert that a SentinelResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &SentinelResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a SentinelResult is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &SentinelResult<T>) {
        match result {
            Err(SentinelError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert that a SentinelResult is an idempotency Conflict.
    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &SentinelResult<T>) {
        match result {
            Err(err) if err.is_conflict() => {}
            other => panic!("Expected Conflict, got: {:?}", other),
        }
    }

    /// Assert that a SentinelResult is a ProcessingTimeout.
    #[track_caller]
    pub fn assert_processing_timeout<T: std::fmt::Debug>(result: &SentinelResult<T>) {
        match result {
            Err(SentinelError::Coordination(CoordinationError::ProcessingTimeout { .. })) => {}
            other => panic!("Expected ProcessingTimeout, got: {:?}", other),
        }
    }

    /// Assert that an execution replayed a completed response.
    #[track_caller]
    pub fn assert_replayed(execution: &Execution, expected: &StoredResponse) {
        assert!(execution.is_replay(), "Expected a replay, got: {:?}", execution);
        assert_eq!(
            execution.outcome(),
            &RecordedOutcome::Completed(expected.clone()),
            "Replayed response differs from the stored one"
        );
    }

    /// Assert that a counter was bumped exactly `expected` times.
    #[track_caller]
    pub fn assert_counter(metrics: &InMemoryMetrics, counter: Counter, expected: u64) {
        assert_eq!(
            metrics.count(counter),
            expected,
            "Counter {:?} mismatch",
            counter
        );
    }

    /// Assert that a SentinelConfig is valid.
    #[track_caller]
    pub fn assert_config_valid(config: &SentinelConfig) {
        if let Err(e) = config.validate() {
            panic!("Config validation failed: {:?}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
