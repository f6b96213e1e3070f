//! SENTINEL Core - Entity Types
//!
//! Pure data structures shared by the cache store, lock manager, idempotency
//! coordinator and dead-letter sweeper. All other crates depend on this.

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

pub mod clock;
pub mod config;
pub mod constants;
pub mod dlq;
pub mod entry;
pub mod error;
pub mod idempotency;
pub mod lock;
pub mod metrics;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    BackoffStrategy, CacheSettings, DlqSettings, IdempotencySettings, JobSettings, LockSettings,
    SentinelConfig, StatsSettings,
};
pub use dlq::FailedEvent;
pub use entry::CacheEntry;
pub use error::{
    ConfigError, CoordinationError, SentinelError, SentinelResult, StorageError, ValidationError,
};
pub use idempotency::{
    FailedPolicy, Fingerprint, IdempotencyRecord, IdempotencyStatus, IdempotencyToken,
    StoredHeader, StoredResponse,
};
pub use lock::CacheLock;
pub use metrics::{Counter, InMemoryMetrics, MetricsSink, NoopMetrics, SharedMetrics};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// `start + ttl`, saturating at the maximum representable instant.
pub fn expiry_after(start: Timestamp, ttl: Duration) -> Timestamp {
    start
        .checked_add_signed(clock::to_chrono(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Place `key` in its tenant's namespace, or the global one.
///
/// Tenant and global keys live under disjoint prefixes, so no client key
/// without a tenant can spell out another tenant's scoped key.
pub fn scoped_key(tenant: Option<&str>, key: &str) -> String {
    match tenant {
        Some(tenant) => format!("{}{}/{}", constants::TENANT_KEY_PREFIX, tenant, key),
        None => format!("{}{}", constants::GLOBAL_KEY_PREFIX, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_after_saturates() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            expiry_after(now, Duration::from_secs(1)),
            now + chrono::Duration::seconds(1)
        );
    }

    #[test]
    fn test_scoped_key() {
        assert_eq!(scoped_key(None, "a"), "g/a");
        assert_eq!(scoped_key(Some("acme"), "a"), "t/acme/a");
        assert_ne!(scoped_key(Some("x"), "k"), scoped_key(Some("y"), "k"));
        assert_ne!(scoped_key(None, "t/acme/a"), scoped_key(Some("acme"), "a"));
    }
}
