//! Statistics layer.
//!
//! [`StatsBackend`] wraps any [`CacheBackend`] and counts hits, misses, sets
//! and deletes without changing behaviour. Per-key counts live in a bounded
//! space-saving table so memory stays flat no matter how many distinct keys
//! pass through.

use std::collections::hash_map::RandomState;
use std::collections::{BTreeSet, HashMap};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sentinel_core::constants::{MAX_STATS_SHARDS, MIN_KEYS_PER_STATS_SHARD};
use sentinel_core::{CacheEntry, Counter, NoopMetrics, SentinelResult, SharedMetrics};

use super::traits::{CacheBackend, CacheStats, KeyStats};

/// Approximate top-K table of per-key hit/miss counts.
///
/// Keys hash to one of several independently locked shards, each a
/// space-saving summary: when a shard is full, a new key evicts the shard's
/// entry with the smallest estimate and inherits that estimate as its error
/// bound. A key always lands in the same shard, so estimates never
/// under-report.
#[derive(Debug)]
pub struct KeyStatsTable {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
}

impl KeyStatsTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let count = (capacity / MIN_KEYS_PER_STATS_SHARD).clamp(1, MAX_STATS_SHARDS);
        let shards = (0..count)
            .map(|i| {
                let share = capacity / count + usize::from(i < capacity % count);
                Mutex::new(Shard::new(share))
            })
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, key: &str, hit: bool) {
        let index = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;
        lock(&self.shards[index]).record(key, hit);
    }

    /// The `n` keys with the highest estimated totals.
    pub fn top(&self, n: usize) -> Vec<KeyStats> {
        let mut all: Vec<KeyStats> = self
            .shards
            .iter()
            .flat_map(|shard| lock(shard).entries.values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| {
            b.estimate()
                .cmp(&a.estimate())
                .then_with(|| a.key.cmp(&b.key))
        });
        all.truncate(n);
        all
    }
}

fn lock(shard: &Mutex<Shard>) -> std::sync::MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Shard {
    capacity: usize,
    entries: HashMap<String, KeyStats>,
    /// `(estimate, key)` for every entry; the first element is the victim
    by_estimate: BTreeSet<(u64, String)>,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            by_estimate: BTreeSet::new(),
        }
    }

    fn record(&mut self, key: &str, hit: bool) {
        if !self.entries.contains_key(key) {
            let mut stats = KeyStats {
                key: key.to_string(),
                ..Default::default()
            };
            if self.entries.len() >= self.capacity {
                if let Some((floor, victim)) = self.by_estimate.pop_first() {
                    self.entries.remove(&victim);
                    stats.error = floor;
                }
            }
            self.by_estimate.insert((stats.estimate(), key.to_string()));
            self.entries.insert(key.to_string(), stats);
        }

        if let Some(stats) = self.entries.get_mut(key) {
            self.by_estimate.remove(&(stats.estimate(), key.to_string()));
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
            self.by_estimate.insert((stats.estimate(), key.to_string()));
        }
    }
}

/// Transparent counting decorator over a cache backend.
#[derive(Debug)]
pub struct StatsBackend {
    inner: Arc<dyn CacheBackend>,
    metrics: SharedMetrics,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    per_key: KeyStatsTable,
    top_n: usize,
}

impl StatsBackend {
    pub fn new(inner: Arc<dyn CacheBackend>, max_tracked_keys: usize) -> Self {
        Self {
            inner,
            metrics: Arc::new(NoopMetrics),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            per_key: KeyStatsTable::new(max_tracked_keys),
            top_n: 10,
        }
    }

    /// Forward every counter to an external sink as well.
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// How many keys `stats().top_keys` reports.
    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// Number of distinct keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.per_key.len()
    }

    fn record_read(&self, key: &str, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.record(Counter::CacheHit);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.record(Counter::CacheMiss);
        }
        self.per_key.record(key, hit);
    }

    fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(Counter::CacheSet);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(Counter::CacheDelete);
    }
}

#[async_trait]
impl CacheBackend for StatsBackend {
    async fn get(&self, key: &str) -> SentinelResult<Option<CacheEntry>> {
        let result = self.inner.get(key).await?;
        self.record_read(key, result.is_some());
        Ok(result)
    }

    async fn put(&self, entry: CacheEntry) -> SentinelResult<()> {
        self.inner.put(entry).await?;
        self.record_set();
        Ok(())
    }

    async fn put_if_absent(&self, entry: CacheEntry) -> SentinelResult<bool> {
        let created = self.inner.put_if_absent(entry).await?;
        if created {
            self.record_set();
        }
        Ok(created)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        replacement: Option<CacheEntry>,
    ) -> SentinelResult<bool> {
        let is_delete = replacement.is_none();
        let swapped = self.inner.compare_and_swap(key, expected, replacement).await?;
        if swapped {
            if is_delete {
                self.record_delete();
            } else {
                self.record_set();
            }
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> SentinelResult<bool> {
        let existed = self.inner.delete(key).await?;
        if existed {
            self.record_delete();
        }
        Ok(existed)
    }

    async fn flush(&self) -> SentinelResult<u64> {
        self.inner.flush().await
    }

    async fn purge_expired(&self, prefix: &str) -> SentinelResult<u64> {
        self.inner.purge_expired(prefix).await
    }

    async fn invalidate_tag(&self, tag: &str) -> SentinelResult<u64> {
        self.inner.invalidate_tag(tag).await
    }

    async fn invalidate_tenant(&self, tenant: &str) -> SentinelResult<u64> {
        self.inner.invalidate_tenant(tenant).await
    }

    async fn stats(&self) -> SentinelResult<CacheStats> {
        let inner = self.inner.stats().await?;
        let top_keys = self.per_key.top(self.top_n);

        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            top_keys,
            ..inner
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryBackend;
    use sentinel_core::{Clock, InMemoryMetrics, ManualClock};
    use std::time::Duration;

    fn stats_backend(capacity: usize) -> (StatsBackend, ManualClock, InMemoryMetrics) {
        let clock = ManualClock::starting_now();
        let inner = Arc::new(InMemoryBackend::new(Arc::new(clock.clone())));
        let metrics = InMemoryMetrics::new();
        let backend = StatsBackend::new(inner, capacity).with_metrics(Arc::new(metrics.clone()));
        (backend, clock, metrics)
    }

    #[tokio::test]
    async fn test_counts_hits_misses_sets_deletes() -> SentinelResult<()> {
        let (backend, clock, metrics) = stats_backend(8);
        let entry = CacheEntry::new("k", b"v".to_vec(), Duration::from_secs(5), clock.now());

        backend.put(entry).await?;
        backend.get("k").await?;
        backend.get("k").await?;
        backend.get("missing").await?;
        backend.delete("k").await?;
        backend.delete("k").await?;

        let stats = backend.stats().await?;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(metrics.count(Counter::CacheHit), 2);
        assert_eq!(metrics.count(Counter::CacheMiss), 1);
        assert_eq!(stats.top_keys.first().map(|k| k.key.as_str()), Some("k"));
        Ok(())
    }

    #[tokio::test]
    async fn test_per_key_cardinality_is_bounded() -> SentinelResult<()> {
        let (backend, _, _) = stats_backend(4);
        for i in 0..100 {
            backend.get(&format!("key-{}", i)).await?;
        }
        assert_eq!(backend.tracked_keys(), 4);
        assert_eq!(backend.stats().await?.misses, 100);
        Ok(())
    }

    #[test]
    fn test_key_stats_table_keeps_heavy_hitters() {
        let table = KeyStatsTable::new(3);
        for _ in 0..50 {
            table.record("hot", true);
        }
        for i in 0..20 {
            table.record(&format!("cold-{}", i), false);
        }

        let top = table.top(1);
        assert_eq!(top[0].key, "hot");
        assert_eq!(top[0].hits, 50);
        assert_eq!(table.len(), 3);
        assert_eq!(table.shard_count(), 1);
    }

    #[test]
    fn test_large_table_is_sharded_and_bounded() {
        let table = KeyStatsTable::new(1024);
        assert_eq!(table.shard_count(), 16);

        for i in 0..5000 {
            table.record(&format!("key-{}", i), false);
        }
        for _ in 0..500 {
            table.record("hot", true);
        }
        assert!(table.len() <= 1024);
        assert_eq!(table.top(1)[0].key, "hot");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_are_all_counted() -> SentinelResult<()> {
        let (backend, _, _) = stats_backend(256);
        let backend = Arc::new(backend);
        let mut handles = Vec::new();
        for worker in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    backend.get(&format!("w{}-{}", worker, i % 10)).await?;
                }
                Ok::<_, sentinel_core::SentinelError>(())
            }));
        }
        for handle in handles {
            handle.await.expect("reader panicked")?;
        }

        let stats = backend.stats().await?;
        assert_eq!(stats.misses, 400);
        assert_eq!(backend.tracked_keys(), 80);
        assert_eq!(stats.top_keys.len(), 10);
        assert!(stats.top_keys.iter().all(|k| k.misses == 5));
        Ok(())
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The table never grows past its capacity
        #[test]
        fn prop_table_bounded(
            keys in prop::collection::vec("[a-z]{1,4}", 0..200),
            capacity in 1usize..16,
        ) {
            let table = KeyStatsTable::new(capacity);
            for key in &keys {
                table.record(key, true);
            }
            prop_assert!(table.len() <= capacity);
        }

        /// Estimated counts never under-report a key that is still tracked,
        /// with one shard or many
        #[test]
        fn prop_estimates_never_underestimate(
            keys in prop::collection::vec(0u16..600, 1..400),
            capacity in prop_oneof![1usize..8, 128usize..256],
        ) {
            let table = KeyStatsTable::new(capacity);
            let mut truth: HashMap<String, u64> = HashMap::new();
            for k in &keys {
                let key = format!("k{}", k);
                table.record(&key, true);
                *truth.entry(key).or_insert(0) += 1;
            }
            for stats in table.top(capacity) {
                prop_assert!(stats.estimate() >= truth[&stats.key]);
            }
        }
    }
}
