//! Cache backend trait and statistics snapshot.
//!
//! This module defines the contract every key/value backend must honour. The
//! in-memory implementation is the reference; a remote backend (Redis,
//! memcached) maps each method onto its native atomic primitive.

use async_trait::async_trait;
use sentinel_core::{CacheEntry, SentinelResult};
use std::fmt;

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be thread-safe. Operations on the same key are
/// linearizable; operations on different keys never wait on each other's
/// critical sections.
///
/// # Expiry
///
/// An entry whose `expires_at` has passed is indistinguishable from an absent
/// one: `get` misses, `delete` reports `false`, and `put_if_absent` may claim
/// the slot. Physical removal happens lazily or through `purge_expired`.
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Get a live entry, recording the access.
    async fn get(&self, key: &str) -> SentinelResult<Option<CacheEntry>>;

    /// Insert or overwrite an entry.
    async fn put(&self, entry: CacheEntry) -> SentinelResult<()>;

    /// Insert only if no live entry exists under the key.
    ///
    /// Returns `true` if this call created the entry. Concurrent callers on
    /// the same key see exactly one `true`.
    async fn put_if_absent(&self, entry: CacheEntry) -> SentinelResult<bool>;

    /// Atomically replace (or remove, when `replacement` is `None`) the live
    /// entry under `key`, but only if its current value equals `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        replacement: Option<CacheEntry>,
    ) -> SentinelResult<bool>;

    /// Delete an entry. Returns whether a live entry existed.
    async fn delete(&self, key: &str) -> SentinelResult<bool>;

    /// Remove everything. Returns the number of entries dropped.
    async fn flush(&self) -> SentinelResult<u64>;

    /// Physically remove expired entries whose key starts with `prefix`
    /// (`""` matches all). Returns the number removed.
    async fn purge_expired(&self, prefix: &str) -> SentinelResult<u64>;

    /// Remove every live entry carrying `tag`.
    async fn invalidate_tag(&self, tag: &str) -> SentinelResult<u64>;

    /// Remove every live entry owned by `tenant`.
    async fn invalidate_tenant(&self, tenant: &str) -> SentinelResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> SentinelResult<CacheStats>;
}

/// Per-key access counts kept by the statistics layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStats {
    pub key: String,
    pub hits: u64,
    pub misses: u64,
    /// Upper bound on how much the counts may be overestimated after the key
    /// displaced another one from the bounded table
    pub error: u64,
}

impl KeyStats {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    /// Observed total plus the inherited error; never below the true count.
    pub fn estimate(&self) -> u64 {
        self.total() + self.error
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Number of live entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of entries physically removed after expiry.
    pub evictions: u64,
    /// Most accessed keys, highest first.
    pub top_keys: Vec<KeyStats>,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
