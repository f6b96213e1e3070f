//! Idempotency coordinator.
//!
//! Guarantees that the operation behind an idempotency key runs at most once
//! and that every repeat of the same request observes the same outcome.
//!
//! # Protocol
//!
//! For a request `(key, fingerprint)`:
//!
//! 1. `put_if_absent` a `Processing` record. Exactly one concurrent caller
//!    wins and receives an [`IdempotencyToken`].
//! 2. Everyone else reads the existing record:
//!    - different fingerprint: `Conflict`
//!    - `Processing`: wait (bounded, cancellable) or report in-flight
//!    - `Completed`: replay the stored response verbatim
//!    - `Failed`: replay the failure, or under [`FailedPolicy::RetryOnce`]
//!      reclaim the record for one fresh attempt
//! 3. The winner finishes with `complete` or `fail`. Both compare-and-swap
//!    against the record it created, so a caller whose record expired and
//!    was reclaimed by a newer `begin` gets `StaleToken` instead of
//!    overwriting someone else's state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::constants::{DEFAULT_MAX_KEY_BYTES, IDEMPOTENCY_KEY_PREFIX, MAX_CAS_ATTEMPTS};
use sentinel_core::{
    CacheEntry, CoordinationError, Counter, FailedPolicy, Fingerprint, IdempotencySettings,
    IdempotencyRecord, IdempotencyStatus, IdempotencyToken, NoopMetrics, SentinelError,
    SentinelResult, SharedClock, SharedMetrics, StorageError, StoredResponse, Timestamp,
    ValidationError,
};
use sentinel_storage::CacheBackend;
use tokio::sync::watch;

use crate::wait::{PollWait, WaitError};

/// What a lookup of `(key, fingerprint)` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    NotFound,
    /// Another execution is in flight
    Processing { started_at: Timestamp },
    Completed(StoredResponse),
    Failed {
        error: String,
        response: Option<StoredResponse>,
    },
    /// The key was used with a different request
    Conflict,
}

impl IdempotencyCheck {
    /// The finished outcome, if the record is terminal.
    pub fn outcome(&self) -> Option<RecordedOutcome> {
        match self {
            IdempotencyCheck::Completed(response) => {
                Some(RecordedOutcome::Completed(response.clone()))
            }
            IdempotencyCheck::Failed { error, response } => Some(RecordedOutcome::Failed {
                error: error.clone(),
                response: response.clone(),
            }),
            _ => None,
        }
    }
}

/// Result of `begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// This caller won and must finish the record
    Created(IdempotencyToken),
    AlreadyExists(IdempotencyCheck),
}

/// The terminal result of an operation, as stored and replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOutcome {
    Completed(StoredResponse),
    Failed {
        error: String,
        response: Option<StoredResponse>,
    },
}

/// Result of [`IdempotencyCoordinator::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// The operation ran during this call
    Executed(RecordedOutcome),
    /// A previous execution's outcome
    Replayed(RecordedOutcome),
}

impl Execution {
    pub fn outcome(&self) -> &RecordedOutcome {
        match self {
            Execution::Executed(outcome) | Execution::Replayed(outcome) => outcome,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }
}

/// Optional request metadata stored on a new record.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub method: Option<String>,
    pub path: Option<String>,
    pub client_id: Option<String>,
    /// Overrides the configured default TTL
    pub ttl: Option<Duration>,
}

/// Error stored on a record whose executing future was dropped.
pub const ABANDONED_ERROR: &str = "execution abandoned before completion";

/// At-most-once execution per idempotency key.
#[derive(Debug, Clone)]
pub struct IdempotencyCoordinator {
    backend: Arc<dyn CacheBackend>,
    clock: SharedClock,
    settings: IdempotencySettings,
    metrics: SharedMetrics,
    max_key_bytes: usize,
}

impl IdempotencyCoordinator {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        clock: SharedClock,
        settings: IdempotencySettings,
    ) -> Self {
        Self {
            backend,
            clock,
            settings,
            metrics: Arc::new(NoopMetrics),
            max_key_bytes: DEFAULT_MAX_KEY_BYTES,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Bound client keys to the backend's configured key size.
    pub fn with_max_key_bytes(mut self, max_key_bytes: usize) -> Self {
        self.max_key_bytes = max_key_bytes;
        self
    }

    pub fn settings(&self) -> &IdempotencySettings {
        &self.settings
    }

    /// Look up `key` without changing anything.
    pub async fn check(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
    ) -> SentinelResult<IdempotencyCheck> {
        self.validate_key(key)?;
        match self.load(key).await? {
            Some((_, record)) => classify(record, fingerprint),
            None => Ok(IdempotencyCheck::NotFound),
        }
    }

    /// The raw record, for inspection.
    pub async fn get_record(&self, key: &str) -> SentinelResult<Option<IdempotencyRecord>> {
        self.validate_key(key)?;
        Ok(self.load(key).await?.map(|(_, record)| record))
    }

    /// Claim `key` for execution.
    pub async fn begin(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
    ) -> SentinelResult<BeginOutcome> {
        self.begin_with(key, fingerprint, &RequestMeta::default())
            .await
    }

    /// Claim `key`, storing request metadata on the new record.
    pub async fn begin_with(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        meta: &RequestMeta,
    ) -> SentinelResult<BeginOutcome> {
        self.validate_key(key)?;
        let ttl = meta.ttl.unwrap_or(self.settings.default_ttl);
        self.validate_ttl(ttl)?;
        let storage_key = storage_key(key);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let record = new_record(key, fingerprint, ttl, now, meta);
            if self.backend.put_if_absent(encode(&record, now)?).await? {
                self.metrics.record(Counter::IdempotencyCreated);
                tracing::debug!(key, generation = %record.generation, "Idempotency record created");
                return Ok(BeginOutcome::Created(record.token()));
            }

            let Some((entry, existing)) = self.load(key).await? else {
                continue;
            };

            if self.may_retry(&existing, fingerprint) {
                let mut fresh = new_record(key, fingerprint, ttl, now, meta);
                fresh.retry_allowed = false;
                if self
                    .backend
                    .compare_and_swap(&storage_key, &entry.value, Some(encode(&fresh, now)?))
                    .await?
                {
                    self.metrics.record(Counter::IdempotencyCreated);
                    tracing::info!(
                        key,
                        generation = %fresh.generation,
                        previous_error = existing.error.as_deref().unwrap_or(""),
                        "Retrying failed idempotent request"
                    );
                    return Ok(BeginOutcome::Created(fresh.token()));
                }
                continue;
            }

            let check = classify(existing, fingerprint)?;
            self.record_check(key, &check);
            return Ok(BeginOutcome::AlreadyExists(check));
        }

        Err(StorageError::Backend {
            reason: format!("contention on idempotency key '{}' did not settle", key),
        }
        .into())
    }

    /// Finish a record successfully, storing `response` for replay.
    pub async fn complete(
        &self,
        token: &IdempotencyToken,
        response: StoredResponse,
    ) -> SentinelResult<()> {
        self.finish(token, |record| {
            record.status = IdempotencyStatus::Completed;
            record.response = Some(response.clone());
        })
        .await?;
        tracing::debug!(key = %token.key, "Idempotency record completed");
        Ok(())
    }

    /// Finish a record as failed.
    pub async fn fail(&self, token: &IdempotencyToken, error: impl Into<String>) -> SentinelResult<()> {
        self.fail_with_response(token, error, None).await
    }

    /// Finish a record as failed, keeping the response that was produced.
    pub async fn fail_with_response(
        &self,
        token: &IdempotencyToken,
        error: impl Into<String>,
        response: Option<StoredResponse>,
    ) -> SentinelResult<()> {
        let error = error.into();
        self.finish(token, |record| {
            record.status = IdempotencyStatus::Failed;
            record.error = Some(error.clone());
            record.response = response.clone();
        })
        .await?;
        tracing::debug!(key = %token.key, error = %error, "Idempotency record failed");
        Ok(())
    }

    /// Wait until the record for `key` leaves `Processing`.
    ///
    /// Returns the settled check, which may be `NotFound` if the record
    /// expired or was force-expired meanwhile. Gives up with
    /// `ProcessingTimeout` after the configured wait, or `Cancelled` once
    /// `cancel` flips to `true`.
    pub async fn wait_for_outcome(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        cancel: Option<watch::Receiver<bool>>,
    ) -> SentinelResult<IdempotencyCheck> {
        let timeout = self.settings.processing_wait_timeout;
        let waited = PollWait::new(timeout, self.settings.poll_interval)
            .with_cancel(cancel)
            .run(move || async move {
                let check = self.check(key, fingerprint).await?;
                Ok(match check {
                    IdempotencyCheck::Processing { .. } => None,
                    settled => Some(settled),
                })
            })
            .await;

        match waited {
            Ok(check) => Ok(check),
            Err(WaitError::TimedOut { waited }) => {
                tracing::warn!(
                    key,
                    waited_ms = waited.as_millis() as u64,
                    "Gave up waiting on in-flight idempotent request"
                );
                Err(CoordinationError::ProcessingTimeout {
                    key: key.to_string(),
                    waited,
                }
                .into())
            }
            Err(WaitError::Cancelled) => Err(CoordinationError::Cancelled {
                key: key.to_string(),
            }
            .into()),
            Err(WaitError::Poll(err)) => Err(err),
        }
    }

    /// Run `op` at most once for `key`.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        op: F,
    ) -> SentinelResult<Execution>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecordedOutcome>,
    {
        self.execute_with(key, fingerprint, &RequestMeta::default(), None, op)
            .await
    }

    /// Run `op` at most once for `key`, with request metadata and a
    /// cancellation signal for the wait on an in-flight duplicate.
    ///
    /// A `Conflict` surfaces as an error. A duplicate that is still running
    /// after the configured wait surfaces as `ProcessingTimeout`.
    pub async fn execute_with<F, Fut>(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        meta: &RequestMeta,
        cancel: Option<watch::Receiver<bool>>,
        op: F,
    ) -> SentinelResult<Execution>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecordedOutcome>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let check = match self.begin_with(key, fingerprint, meta).await? {
                BeginOutcome::Created(token) => {
                    let guard = AbandonGuard::arm(self.clone(), token.clone());
                    let outcome = op().await;
                    self.record_outcome(&token, &outcome).await?;
                    guard.disarm();
                    return Ok(Execution::Executed(outcome));
                }
                BeginOutcome::AlreadyExists(IdempotencyCheck::Processing { .. }) => {
                    self.wait_for_outcome(key, fingerprint, cancel.clone())
                        .await?
                }
                BeginOutcome::AlreadyExists(check) => check,
            };

            match check {
                IdempotencyCheck::Conflict => {
                    return Err(CoordinationError::Conflict {
                        key: key.to_string(),
                    }
                    .into())
                }
                // Record vanished while we waited; claim it again
                IdempotencyCheck::NotFound | IdempotencyCheck::Processing { .. } => continue,
                settled => {
                    if let Some(outcome) = settled.outcome() {
                        return Ok(Execution::Replayed(outcome));
                    }
                }
            }
        }

        Err(CoordinationError::ProcessingTimeout {
            key: key.to_string(),
            waited: self.settings.processing_wait_timeout,
        }
        .into())
    }

    /// Drop the record for `key` regardless of state.
    ///
    /// Administrative recovery for a `Processing` record whose executor
    /// crashed. Returns whether a live record existed.
    pub async fn force_expire(&self, key: &str) -> SentinelResult<bool> {
        self.validate_key(key)?;
        let existed = self.backend.delete(&storage_key(key)).await?;
        if existed {
            tracing::warn!(key, "Idempotency record force-expired");
        }
        Ok(existed)
    }

    /// Physically remove expired records. Returns the number removed.
    pub async fn cleanup_expired(&self) -> SentinelResult<u64> {
        let removed = self.backend.purge_expired(IDEMPOTENCY_KEY_PREFIX).await?;
        if removed > 0 {
            tracing::info!(count = removed, "Cleaned up expired idempotency records");
        }
        Ok(removed)
    }

    async fn record_outcome(
        &self,
        token: &IdempotencyToken,
        outcome: &RecordedOutcome,
    ) -> SentinelResult<()> {
        let result = match outcome {
            RecordedOutcome::Completed(response) => self.complete(token, response.clone()).await,
            RecordedOutcome::Failed { error, response } => {
                self.fail_with_response(token, error.clone(), response.clone())
                    .await
            }
        };

        match result {
            // The operation already ran; its result still belongs to the caller
            Err(err @ SentinelError::Coordination(CoordinationError::StaleToken { .. })) => {
                tracing::warn!(key = %token.key, error = %err, "Outcome not recorded");
                Ok(())
            }
            other => other,
        }
    }

    async fn finish<F>(&self, token: &IdempotencyToken, apply: F) -> SentinelResult<()>
    where
        F: Fn(&mut IdempotencyRecord),
    {
        let storage_key = storage_key(&token.key);
        let stale = || -> SentinelError {
            CoordinationError::StaleToken {
                key: token.key.clone(),
                generation: token.generation,
            }
            .into()
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let Some((entry, record)) = self.load(&token.key).await? else {
                return Err(stale());
            };
            if record.generation != token.generation
                || record.status != IdempotencyStatus::Processing
                || record.is_expired(now)
            {
                return Err(stale());
            }

            let mut updated = record;
            apply(&mut updated);
            if self
                .backend
                .compare_and_swap(&storage_key, &entry.value, Some(encode(&updated, now)?))
                .await?
            {
                return Ok(());
            }
        }

        Err(stale())
    }

    async fn load(&self, key: &str) -> SentinelResult<Option<(CacheEntry, IdempotencyRecord)>> {
        let now = self.clock.now();
        match self.backend.get(&storage_key(key)).await? {
            Some(entry) => {
                let record = decode(&entry)?;
                if record.is_expired(now) {
                    Ok(None)
                } else {
                    Ok(Some((entry, record)))
                }
            }
            None => Ok(None),
        }
    }

    fn may_retry(&self, record: &IdempotencyRecord, fingerprint: &Fingerprint) -> bool {
        self.settings.failed_policy == FailedPolicy::RetryOnce
            && record.status == IdempotencyStatus::Failed
            && record.retry_allowed
            && record.fingerprint == *fingerprint
    }

    fn record_check(&self, key: &str, check: &IdempotencyCheck) {
        match check {
            IdempotencyCheck::Conflict => {
                self.metrics.record(Counter::IdempotencyConflict);
                tracing::warn!(key, "Idempotency key reused with a different request");
            }
            IdempotencyCheck::Processing { .. } => {
                self.metrics.record(Counter::IdempotencyInFlight);
                tracing::debug!(key, "Idempotent request already in flight");
            }
            IdempotencyCheck::Completed(_) | IdempotencyCheck::Failed { .. } => {
                self.metrics.record(Counter::IdempotencyReplay);
                tracing::debug!(key, "Replaying stored idempotent outcome");
            }
            IdempotencyCheck::NotFound => {}
        }
    }

    fn validate_key(&self, key: &str) -> SentinelResult<()> {
        if key.is_empty() {
            return Err(ValidationError::InvalidKey {
                reason: "idempotency key must not be empty".to_string(),
            }
            .into());
        }
        if key.len() > self.max_key_bytes {
            return Err(ValidationError::SizeLimitExceeded {
                field: "idempotency key".to_string(),
                size: key.len(),
                max: self.max_key_bytes,
            }
            .into());
        }
        Ok(())
    }

    fn validate_ttl(&self, ttl: Duration) -> SentinelResult<()> {
        if ttl < self.settings.min_ttl || ttl > self.settings.max_ttl || ttl.is_zero() {
            return Err(ValidationError::InvalidTtl {
                ttl,
                max: self.settings.max_ttl,
            }
            .into());
        }
        Ok(())
    }
}

/// Fails the winner's record if its operation is dropped before the outcome
/// is stored, so duplicates stop waiting on a `Processing` record that can
/// never settle. `fail` checks the generation, so a newer owner is untouched.
struct AbandonGuard {
    coordinator: Option<IdempotencyCoordinator>,
    token: IdempotencyToken,
}

impl AbandonGuard {
    fn arm(coordinator: IdempotencyCoordinator, token: IdempotencyToken) -> Self {
        Self {
            coordinator: Some(coordinator),
            token,
        }
    }

    fn disarm(mut self) {
        self.coordinator = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(coordinator) = self.coordinator.take() else {
            return;
        };
        let token = self.token.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %token.key, "No runtime to settle abandoned idempotency record");
            return;
        };
        handle.spawn(async move {
            match coordinator.fail(&token, ABANDONED_ERROR).await {
                Ok(()) => tracing::warn!(
                    key = %token.key,
                    generation = %token.generation,
                    "Abandoned idempotent execution marked failed"
                ),
                Err(err) => tracing::debug!(
                    key = %token.key,
                    error = %err,
                    "Abandoned idempotency record already settled"
                ),
            }
        });
    }
}

fn new_record(
    key: &str,
    fingerprint: &Fingerprint,
    ttl: Duration,
    now: Timestamp,
    meta: &RequestMeta,
) -> IdempotencyRecord {
    let record = IdempotencyRecord::processing(key, fingerprint.clone(), ttl, now)
        .with_client(meta.client_id.clone());
    match (&meta.method, &meta.path) {
        (Some(method), Some(path)) => record.with_request(method, path),
        _ => record,
    }
}

fn classify(record: IdempotencyRecord, fingerprint: &Fingerprint) -> SentinelResult<IdempotencyCheck> {
    if record.fingerprint != *fingerprint {
        return Ok(IdempotencyCheck::Conflict);
    }

    match record.status {
        IdempotencyStatus::Processing => Ok(IdempotencyCheck::Processing {
            started_at: record.created_at,
        }),
        IdempotencyStatus::Completed => match record.response {
            Some(response) => Ok(IdempotencyCheck::Completed(response)),
            None => Err(StorageError::Serialization {
                key: record.key,
                reason: "completed record has no stored response".to_string(),
            }
            .into()),
        },
        IdempotencyStatus::Failed => Ok(IdempotencyCheck::Failed {
            error: record.error.unwrap_or_default(),
            response: record.response,
        }),
    }
}

fn storage_key(key: &str) -> String {
    format!("{}{}", IDEMPOTENCY_KEY_PREFIX, key)
}

/// Cache entry expiring together with the record.
fn encode(record: &IdempotencyRecord, now: Timestamp) -> SentinelResult<CacheEntry> {
    let value = serde_json::to_vec(record).map_err(|e| StorageError::Serialization {
        key: record.key.clone(),
        reason: e.to_string(),
    })?;
    let ttl = record
        .remaining(now)
        .ok_or_else(|| CoordinationError::StaleToken {
            key: record.key.clone(),
            generation: record.generation,
        })?;
    Ok(CacheEntry::new(storage_key(&record.key), value, ttl, now))
}

fn decode(entry: &CacheEntry) -> SentinelResult<IdempotencyRecord> {
    serde_json::from_slice(&entry.value).map_err(|e| {
        StorageError::Serialization {
            key: entry.key.clone(),
            reason: e.to_string(),
        }
        .into()
    })
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use sentinel_core::ManualClock;
    use sentinel_storage::InMemoryBackend;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("test runtime")
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// A completed record replays byte-identically; any other body conflicts
        #[test]
        fn prop_replay_or_conflict(
            body_a in prop::collection::vec(any::<u8>(), 0..64),
            body_b in prop::collection::vec(any::<u8>(), 0..64),
            status in 200u16..600,
            response_body in prop::collection::vec(any::<u8>(), 0..128),
        ) {
            let rt = runtime();
            let clock = ManualClock::starting_now();
            let backend = Arc::new(InMemoryBackend::new(Arc::new(clock.clone())));
            let idem = IdempotencyCoordinator::new(backend, Arc::new(clock), IdempotencySettings::default());

            let fp_a = Fingerprint::from_request("POST", "/x", None, &body_a);
            let fp_b = Fingerprint::from_request("POST", "/x", None, &body_b);
            let response = StoredResponse::new(status, response_body);

            let outcome = rt.block_on(idem.begin("k", &fp_a));
            let Ok(BeginOutcome::Created(token)) = outcome else {
                return Err(TestCaseError::fail("first begin must create"));
            };
            prop_assert!(rt.block_on(idem.complete(&token, response.clone())).is_ok());

            let replay = rt.block_on(idem.check("k", &fp_a));
            prop_assert_eq!(replay, Ok(IdempotencyCheck::Completed(response)));

            let other = rt.block_on(idem.check("k", &fp_b));
            if body_a == body_b {
                prop_assert!(matches!(other, Ok(IdempotencyCheck::Completed(_))));
            } else {
                prop_assert_eq!(other, Ok(IdempotencyCheck::Conflict));
            }
        }
    }
}
