//! In-memory cache backend.
//!
//! Uses DashMap so that every per-key operation runs under the owning shard's
//! lock only for the duration of a single map operation, and no lock is ever
//! held across an `.await`.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sentinel_core::{CacheEntry, SentinelResult, SharedClock, SystemClock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::traits::{CacheBackend, CacheStats};

/// Process-local backend. Also serves as the fake in tests.
#[derive(Debug)]
pub struct InMemoryBackend {
    entries: DashMap<String, CacheEntry>,
    clock: SharedClock,
    evictions: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            evictions: AtomicU64::new(0),
        }
    }

    /// Backend driven by wall-clock time.
    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }

    /// Remove the entries matching `pred` among live ones and count them.
    fn remove_live_matching<F>(&self, pred: F) -> u64
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let now = self.clock.now();
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now) && pred(e.value()))
            .map(|e| e.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| {
                self.entries
                    .remove_if(key, |_, e| !e.is_expired(now) && pred(e))
                    .is_some()
            })
            .count() as u64
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_system_clock()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> SentinelResult<Option<CacheEntry>> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            None => return Ok(None),
            Some(mut entry) if !entry.is_expired(now) => {
                entry.touch(now);
                return Ok(Some(entry.clone()));
            }
            Some(_) => {}
        }

        // Shard guard is dropped by now; reclaim lazily
        if self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }

    async fn put(&self, entry: CacheEntry) -> SentinelResult<()> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn put_if_absent(&self, entry: CacheEntry) -> SentinelResult<bool> {
        let now = self.clock.now();
        match self.entries.entry(entry.key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(entry);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        replacement: Option<CacheEntry>,
    ) -> SentinelResult<bool> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.is_expired(now) || current.value != expected {
                    return Ok(false);
                }
                match replacement {
                    Some(entry) => {
                        occupied.insert(entry);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> SentinelResult<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| !entry.is_expired(now))
            .unwrap_or(false))
    }

    async fn flush(&self) -> SentinelResult<u64> {
        let count = self.entries.len() as u64;
        self.entries.clear();
        tracing::debug!(count, "Flushed in-memory cache");
        Ok(count)
    }

    async fn purge_expired(&self, prefix: &str) -> SentinelResult<u64> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let removed = expired
            .into_iter()
            .filter(|key| self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some())
            .count() as u64;

        self.evictions.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn invalidate_tag(&self, tag: &str) -> SentinelResult<u64> {
        Ok(self.remove_live_matching(|e| e.has_tag(tag)))
    }

    async fn invalidate_tenant(&self, tenant: &str) -> SentinelResult<u64> {
        Ok(self.remove_live_matching(|e| e.tenant.as_deref() == Some(tenant)))
    }

    async fn stats(&self) -> SentinelResult<CacheStats> {
        let now = self.clock.now();
        let (entry_count, memory_bytes) = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .fold((0u64, 0u64), |(count, bytes), e| {
                (count + 1, bytes + e.value().size_bytes as u64)
            });

        Ok(CacheStats {
            entry_count,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{Clock, ManualClock};
    use std::time::Duration;

    fn backend() -> (InMemoryBackend, ManualClock) {
        let clock = ManualClock::starting_now();
        (InMemoryBackend::new(Arc::new(clock.clone())), clock)
    }

    fn entry(clock: &ManualClock, key: &str, value: &[u8], ttl_secs: u64) -> CacheEntry {
        CacheEntry::new(key, value.to_vec(), Duration::from_secs(ttl_secs), clock.now())
    }

    #[tokio::test]
    async fn test_get_after_expiry_misses_and_reclaims() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "k", b"v", 1)).await?;

        assert!(backend.get("k").await?.is_some());
        clock.advance(Duration::from_secs(1));
        assert!(backend.get("k").await?.is_none());
        assert_eq!(backend.raw_len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_records_access() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "k", b"v", 10)).await?;

        backend.get("k").await?;
        let hit = backend.get("k").await?.expect("live entry");
        assert_eq!(hit.access_count, 2);
        assert_eq!(hit.last_accessed_at, Some(clock.now()));
        Ok(())
    }

    #[tokio::test]
    async fn test_put_if_absent_single_winner() -> SentinelResult<()> {
        let (backend, clock) = backend();
        assert!(backend.put_if_absent(entry(&clock, "k", b"a", 10)).await?);
        assert!(!backend.put_if_absent(entry(&clock, "k", b"b", 10)).await?);

        let current = backend.get("k").await?.expect("live entry");
        assert_eq!(current.value, b"a");
        Ok(())
    }

    #[tokio::test]
    async fn test_put_if_absent_claims_expired_slot() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "k", b"old", 1)).await?;
        clock.advance(Duration::from_secs(2));

        assert!(backend.put_if_absent(entry(&clock, "k", b"new", 10)).await?);
        assert_eq!(backend.get("k").await?.map(|e| e.value), Some(b"new".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_swap() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "k", b"v1", 10)).await?;

        assert!(!backend
            .compare_and_swap("k", b"wrong", Some(entry(&clock, "k", b"v2", 10)))
            .await?);
        assert!(backend
            .compare_and_swap("k", b"v1", Some(entry(&clock, "k", b"v2", 10)))
            .await?);
        assert!(backend.compare_and_swap("k", b"v2", None).await?);
        assert!(backend.get("k").await?.is_none());
        assert!(!backend.compare_and_swap("missing", b"", None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_swap_ignores_expired() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "k", b"v1", 1)).await?;
        clock.advance(Duration::from_secs(1));
        assert!(!backend.compare_and_swap("k", b"v1", None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_reports_existence() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "k", b"v", 10)).await?;
        assert!(backend.delete("k").await?);
        assert!(!backend.delete("k").await?);

        backend.put(entry(&clock, "e", b"v", 1)).await?;
        clock.advance(Duration::from_secs(5));
        assert!(!backend.delete("e").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_expired_with_prefix() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "idem:a", b"", 1)).await?;
        backend.put(entry(&clock, "idem:b", b"", 100)).await?;
        backend.put(entry(&clock, "other", b"", 1)).await?;
        clock.advance(Duration::from_secs(2));

        assert_eq!(backend.purge_expired("idem:").await?, 1);
        assert_eq!(backend.raw_len(), 2);
        assert_eq!(backend.purge_expired("").await?, 1);
        assert_eq!(backend.stats().await?.evictions, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalidate_tag_and_tenant() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend
            .put(entry(&clock, "a", b"", 10).with_tags(vec!["orders".into()]))
            .await?;
        backend
            .put(entry(&clock, "b", b"", 10).with_tags(vec!["orders".into(), "eu".into()]))
            .await?;
        backend.put(entry(&clock, "c", b"", 10).with_tenant("acme")).await?;

        assert_eq!(backend.invalidate_tag("orders").await?, 2);
        assert_eq!(backend.invalidate_tenant("acme").await?, 1);
        assert_eq!(backend.invalidate_tenant("acme").await?, 0);
        assert_eq!(backend.stats().await?.entry_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_counts_live_entries() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "ab", b"xyz", 10)).await?;
        backend.put(entry(&clock, "gone", b"", 1)).await?;
        clock.advance(Duration::from_secs(1));

        let stats = backend.stats().await?;
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.memory_bytes, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_flush() -> SentinelResult<()> {
        let (backend, clock) = backend();
        backend.put(entry(&clock, "a", b"", 10)).await?;
        backend.put(entry(&clock, "b", b"", 10)).await?;
        assert_eq!(backend.flush().await?, 2);
        assert!(backend.get("a").await?.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_put_if_absent_has_one_winner() -> SentinelResult<()> {
        let (backend, clock) = backend();
        let backend = Arc::new(backend);

        let mut handles = Vec::new();
        for i in 0..32u8 {
            let backend = Arc::clone(&backend);
            let candidate = entry(&clock, "race", &[i], 10);
            handles.push(tokio::spawn(async move { backend.put_if_absent(candidate).await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task panicked")? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }
}
