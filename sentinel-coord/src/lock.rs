//! Lease-based lock manager.
//!
//! Locks are ordinary cache entries under `lock:{key}` whose value is the
//! JSON-encoded [`CacheLock`]. Acquisition uses the backend's set-if-absent;
//! release and renew use compare-and-swap against the exact bytes that were
//! read, so a caller whose lease already passed to someone else can never
//! touch the new holder's lock.
//!
//! Safety is bounded by the lease: a holder that stalls past `expires_at`
//! loses the lock without being told. Callers that need to keep a lock
//! across long work renew it themselves.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::constants::{LOCK_KEY_PREFIX, MAX_CAS_ATTEMPTS};
use sentinel_core::{
    CacheEntry, CacheLock, CoordinationError, Counter, LockSettings, NoopMetrics, SentinelResult,
    SharedClock, SharedMetrics, StorageError, Timestamp, ValidationError,
};
use sentinel_storage::CacheBackend;

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now holds the lease
    Acquired(CacheLock),
    /// Someone else holds a live lease
    Busy { holder: String, expires_at: Timestamp },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }

    /// The acquired lock, if any.
    pub fn lock(self) -> Option<CacheLock> {
        match self {
            AcquireOutcome::Acquired(lock) => Some(lock),
            AcquireOutcome::Busy { .. } => None,
        }
    }
}

/// Result of a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// No live lock, or it belongs to someone else
    NotOwner,
}

/// Result of a renew attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed(CacheLock),
    NotOwner,
}

/// Mutual exclusion on top of a [`CacheBackend`].
#[derive(Debug, Clone)]
pub struct LockManager {
    backend: Arc<dyn CacheBackend>,
    clock: SharedClock,
    settings: LockSettings,
    metrics: SharedMetrics,
}

impl LockManager {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: SharedClock, settings: LockSettings) -> Self {
        Self {
            backend,
            clock,
            settings,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Acquire `key` for `owner_id`.
    ///
    /// Succeeds if the lock is free, or if `owner_id` already holds it, in
    /// which case the lease is refreshed to `now + ttl`.
    pub async fn acquire(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> SentinelResult<AcquireOutcome> {
        self.acquire_lease(key, owner_id, ttl, false).await
    }

    /// Acquire with the configured default TTL.
    pub async fn acquire_with_default(
        &self,
        key: &str,
        owner_id: &str,
    ) -> SentinelResult<AcquireOutcome> {
        self.acquire(key, owner_id, self.settings.default_ttl).await
    }

    /// Acquire a lease flagged for renewal by its holder.
    pub async fn acquire_auto_renew(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> SentinelResult<AcquireOutcome> {
        self.acquire_lease(key, owner_id, ttl, true).await
    }

    async fn acquire_lease(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
        auto_renew: bool,
    ) -> SentinelResult<AcquireOutcome> {
        self.validate(key, owner_id, ttl)?;
        let storage_key = storage_key(key);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let lock = CacheLock::new(key, owner_id, ttl, now).with_auto_renew(auto_renew);
            if self.backend.put_if_absent(encode(&lock, now)?).await? {
                self.metrics.record(Counter::LockAcquired);
                tracing::debug!(key, owner_id, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
                return Ok(AcquireOutcome::Acquired(lock));
            }

            let Some(entry) = self.backend.get(&storage_key).await? else {
                // Released or expired between the two calls
                continue;
            };
            let current = decode(&entry)?;

            if !current.is_held_by(owner_id, now) {
                self.metrics.record(Counter::LockContention);
                tracing::debug!(key, owner_id, holder = %current.owner_id, "Lock busy");
                return Ok(AcquireOutcome::Busy {
                    holder: current.owner_id,
                    expires_at: current.expires_at,
                });
            }

            let refreshed = CacheLock {
                expires_at: sentinel_core::expiry_after(now, ttl),
                ttl,
                auto_renew: current.auto_renew || auto_renew,
                ..current
            };
            if self
                .backend
                .compare_and_swap(&storage_key, &entry.value, Some(encode(&refreshed, now)?))
                .await?
            {
                self.metrics.record(Counter::LockAcquired);
                tracing::debug!(key, owner_id, "Lock re-acquired by current holder");
                return Ok(AcquireOutcome::Acquired(refreshed));
            }
        }

        Err(CoordinationError::LockBusy {
            key: key.to_string(),
        }
        .into())
    }

    /// Release `key` if `owner_id` holds a live lease on it.
    pub async fn release(&self, key: &str, owner_id: &str) -> SentinelResult<ReleaseOutcome> {
        let storage_key = storage_key(key);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let Some(entry) = self.backend.get(&storage_key).await? else {
                self.record_not_owner(key, owner_id);
                return Ok(ReleaseOutcome::NotOwner);
            };
            if !decode(&entry)?.is_held_by(owner_id, now) {
                self.record_not_owner(key, owner_id);
                return Ok(ReleaseOutcome::NotOwner);
            }
            if self
                .backend
                .compare_and_swap(&storage_key, &entry.value, None)
                .await?
            {
                self.metrics.record(Counter::LockReleased);
                tracing::debug!(key, owner_id, "Lock released");
                return Ok(ReleaseOutcome::Released);
            }
        }

        self.record_not_owner(key, owner_id);
        Ok(ReleaseOutcome::NotOwner)
    }

    /// Extend the lease to `now + ttl` and bump its renew count.
    pub async fn renew(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> SentinelResult<RenewOutcome> {
        self.validate(key, owner_id, ttl)?;
        let storage_key = storage_key(key);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let Some(entry) = self.backend.get(&storage_key).await? else {
                self.record_not_owner(key, owner_id);
                return Ok(RenewOutcome::NotOwner);
            };
            let current = decode(&entry)?;
            if !current.is_held_by(owner_id, now) {
                self.record_not_owner(key, owner_id);
                return Ok(RenewOutcome::NotOwner);
            }

            let renewed = current.renewed(ttl, now);
            if self
                .backend
                .compare_and_swap(&storage_key, &entry.value, Some(encode(&renewed, now)?))
                .await?
            {
                tracing::trace!(key, owner_id, renew_count = renewed.renew_count, "Lock renewed");
                return Ok(RenewOutcome::Renewed(renewed));
            }
        }

        self.record_not_owner(key, owner_id);
        Ok(RenewOutcome::NotOwner)
    }

    /// The live lock on `key`, if any.
    pub async fn get(&self, key: &str) -> SentinelResult<Option<CacheLock>> {
        let now = self.clock.now();
        match self.backend.get(&storage_key(key)).await? {
            Some(entry) => {
                let lock = decode(&entry)?;
                Ok((!lock.is_expired(now)).then_some(lock))
            }
            None => Ok(None),
        }
    }

    pub async fn is_locked(&self, key: &str) -> SentinelResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Run `f` while holding `key`, releasing afterwards.
    ///
    /// Fails with `LockBusy` when another owner holds the lease. If the lease
    /// lapsed while `f` ran, the result is still returned and the lapse is
    /// logged.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
        f: F,
    ) -> SentinelResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let AcquireOutcome::Busy { .. } = self.acquire(key, owner_id, ttl).await? {
            return Err(CoordinationError::LockBusy {
                key: key.to_string(),
            }
            .into());
        }

        let output = f().await;

        if self.release(key, owner_id).await? == ReleaseOutcome::NotOwner {
            tracing::warn!(key, owner_id, "Lease lapsed before the critical section finished");
        }
        Ok(output)
    }

    fn record_not_owner(&self, key: &str, owner_id: &str) {
        self.metrics.record(Counter::LockNotOwner);
        tracing::debug!(key, owner_id, "Caller does not own lock");
    }

    fn validate(&self, key: &str, owner_id: &str, ttl: Duration) -> SentinelResult<()> {
        if key.is_empty() {
            return Err(ValidationError::InvalidKey {
                reason: "lock key must not be empty".to_string(),
            }
            .into());
        }
        if owner_id.is_empty() {
            return Err(ValidationError::InvalidKey {
                reason: "lock owner must not be empty".to_string(),
            }
            .into());
        }
        if ttl.is_zero() || ttl > self.settings.max_ttl {
            return Err(ValidationError::InvalidTtl {
                ttl,
                max: self.settings.max_ttl,
            }
            .into());
        }
        Ok(())
    }
}

fn storage_key(key: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, key)
}

/// Cache entry whose expiry coincides with the lease.
fn encode(lock: &CacheLock, now: Timestamp) -> SentinelResult<CacheEntry> {
    let value = serde_json::to_vec(lock).map_err(|e| StorageError::Serialization {
        key: lock.key.clone(),
        reason: e.to_string(),
    })?;
    let ttl = (lock.expires_at - now).to_std().unwrap_or(lock.ttl);
    Ok(CacheEntry::new(storage_key(&lock.key), value, ttl, now))
}

fn decode(entry: &CacheEntry) -> SentinelResult<CacheLock> {
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
mod tests {
    use super::*;
    use sentinel_core::{Clock, InMemoryMetrics, ManualClock, SentinelError};
    use sentinel_storage::InMemoryBackend;

    fn manager() -> (LockManager, ManualClock, InMemoryMetrics) {
        let clock = ManualClock::starting_now();
        let backend = Arc::new(InMemoryBackend::new(Arc::new(clock.clone())));
        let metrics = InMemoryMetrics::new();
        let manager = LockManager::new(backend, Arc::new(clock.clone()), LockSettings::default())
            .with_metrics(Arc::new(metrics.clone()));
        (manager, clock, metrics)
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_busy_until_lease_expires() -> SentinelResult<()> {
        let (locks, clock, metrics) = manager();

        assert!(locks.acquire("orders", "a", TTL).await?.is_acquired());
        let busy = locks.acquire("orders", "b", TTL).await?;
        assert!(matches!(busy, AcquireOutcome::Busy { ref holder, .. } if holder == "a"));
        assert_eq!(metrics.count(Counter::LockContention), 1);

        clock.advance(Duration::from_secs(29));
        assert!(!locks.acquire("orders", "b", TTL).await?.is_acquired());

        clock.advance(Duration::from_secs(1));
        let lock = locks.acquire("orders", "b", TTL).await?.lock();
        assert_eq!(lock.map(|l| l.owner_id), Some("b".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_reacquire_by_same_owner_refreshes_lease() -> SentinelResult<()> {
        let (locks, clock, _) = manager();
        let first = locks.acquire("k", "a", TTL).await?.lock();

        clock.advance(Duration::from_secs(20));
        let second = locks.acquire("k", "a", TTL).await?.lock();

        let (Some(first), Some(second)) = (first, second) else {
            panic!("same owner must be able to re-acquire");
        };
        assert_eq!(first.lock_id, second.lock_id);
        assert_eq!(second.expires_at, clock.now() + chrono::Duration::seconds(30));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_after_lease_passed_is_not_owner() -> SentinelResult<()> {
        let (locks, clock, metrics) = manager();
        locks.acquire("k", "a", TTL).await?;

        clock.advance(TTL);
        assert!(locks.acquire("k", "b", TTL).await?.is_acquired());

        assert_eq!(locks.release("k", "a").await?, ReleaseOutcome::NotOwner);
        assert_eq!(metrics.count(Counter::LockNotOwner), 1);
        assert_eq!(locks.get("k").await?.map(|l| l.owner_id), Some("b".to_string()));

        assert_eq!(locks.release("k", "b").await?, ReleaseOutcome::Released);
        assert!(!locks.is_locked("k").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_when_free_is_not_owner() -> SentinelResult<()> {
        let (locks, _, _) = manager();
        assert_eq!(locks.release("nothing", "a").await?, ReleaseOutcome::NotOwner);
        Ok(())
    }

    #[tokio::test]
    async fn test_renew_extends_from_now() -> SentinelResult<()> {
        let (locks, clock, _) = manager();
        locks.acquire("k", "a", TTL).await?;

        clock.advance(Duration::from_secs(25));
        let renewed = locks.renew("k", "a", TTL).await?;
        let RenewOutcome::Renewed(lock) = renewed else {
            panic!("owner must be able to renew");
        };
        assert_eq!(lock.renew_count, 1);
        assert_eq!(lock.expires_at, clock.now() + chrono::Duration::seconds(30));

        // Past the original expiry, still held thanks to the renewal
        clock.advance(Duration::from_secs(10));
        assert!(locks.is_locked("k").await?);
        assert_eq!(locks.renew("k", "b", TTL).await?, RenewOutcome::NotOwner);
        Ok(())
    }

    #[tokio::test]
    async fn test_renew_after_expiry_is_not_owner() -> SentinelResult<()> {
        let (locks, clock, _) = manager();
        locks.acquire("k", "a", TTL).await?;
        clock.advance(TTL);
        assert_eq!(locks.renew("k", "a", TTL).await?, RenewOutcome::NotOwner);
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_renew_flag_is_recorded() -> SentinelResult<()> {
        let (locks, _, _) = manager();
        locks.acquire_auto_renew("k", "a", TTL).await?;
        assert_eq!(locks.get("k").await?.map(|l| l.auto_renew), Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_with_lock_releases_afterwards() -> SentinelResult<()> {
        let (locks, _, _) = manager();

        let value = locks.with_lock("k", "a", TTL, || async { 42 }).await?;
        assert_eq!(value, 42);
        assert!(!locks.is_locked("k").await?);

        locks.acquire("k", "b", TTL).await?;
        let result = locks.with_lock("k", "a", TTL, || async { 0 }).await;
        assert!(matches!(
            result,
            Err(SentinelError::Coordination(CoordinationError::LockBusy { .. }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let (locks, _, _) = manager();
        assert!(matches!(
            locks.acquire("", "a", TTL).await,
            Err(SentinelError::Validation(ValidationError::InvalidKey { .. }))
        ));
        assert!(matches!(
            locks.acquire("k", "a", Duration::ZERO).await,
            Err(SentinelError::Validation(ValidationError::InvalidTtl { .. }))
        ));
        assert!(matches!(
            locks.acquire("k", "a", Duration::from_secs(3601)).await,
            Err(SentinelError::Validation(ValidationError::InvalidTtl { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_single_winner() -> SentinelResult<()> {
        let (locks, _, _) = manager();
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("hot", &format!("owner-{}", i), TTL).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            let outcome = handle.await.map_err(|e| StorageError::Backend {
                reason: e.to_string(),
            })??;
            if outcome.is_acquired() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }
}
