//! Cache entry with expiry and size accounting.

use crate::{expiry_after, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A value held by the TTL cache.
///
/// `expires_at` is always `created_at + ttl`; nothing mutates one without the
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub created_at: Timestamp,
    pub ttl: Duration,
    pub expires_at: Timestamp,
    /// Tenant owning this entry, if scoped
    pub tenant: Option<String>,
    pub tags: Vec<String>,
    /// Key length plus value length
    pub size_bytes: usize,
    pub access_count: u64,
    pub last_accessed_at: Option<Timestamp>,
}

impl CacheEntry {
    /// Create an entry that lives for `ttl` starting at `now`.
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Duration, now: Timestamp) -> Self {
        let key = key.into();
        let size_bytes = key.len() + value.len();
        Self {
            key,
            value,
            created_at: now,
            ttl,
            expires_at: expiry_after(now, ttl),
            tenant: None,
            tags: Vec::new(),
            size_bytes,
            access_count: 0,
            last_accessed_at: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Whether the entry is expired at `now`. Pure function of `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime, or `None` once expired.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Record a read.
    pub fn touch(&mut self, now: Timestamp) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = Some(now);
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_entry_expiry_boundary() {
        let now = Utc::now();
        let entry = CacheEntry::new("k", b"v".to_vec(), Duration::from_secs(1), now);

        assert_eq!(entry.expires_at, now + chrono::Duration::seconds(1));
        assert!(!entry.is_expired(now));
        assert!(!entry.is_expired(now + chrono::Duration::milliseconds(999)));
        assert!(entry.is_expired(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_entry_size_accounting() {
        let entry = CacheEntry::new("abc", vec![0u8; 10], Duration::from_secs(1), Utc::now());
        assert_eq!(entry.size_bytes, 13);
    }

    #[test]
    fn test_entry_touch() {
        let now = Utc::now();
        let mut entry = CacheEntry::new("k", vec![], Duration::from_secs(1), now);
        entry.touch(now);
        entry.touch(now);
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed_at, Some(now));
    }

    #[test]
    fn test_entry_remaining() {
        let now = Utc::now();
        let entry = CacheEntry::new("k", vec![], Duration::from_secs(10), now);
        assert_eq!(entry.remaining(now), Some(Duration::from_secs(10)));
        assert_eq!(entry.remaining(now + chrono::Duration::seconds(10)), None);
    }
}
