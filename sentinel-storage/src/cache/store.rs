//! TTL cache store.
//!
//! The public face of the cache: validates keys, values and TTLs against the
//! configured bounds, stamps entries with the injected clock, and delegates
//! storage to a [`CacheBackend`].
//!
//! Every key is namespaced before it reaches the backend: `g/{key}` for
//! global entries and `t/{tenant}/{key}` for tenant entries. Lock and
//! idempotency records share the backend under their own prefixes, so
//! nothing stored through this type can alias them.

use std::sync::Arc;
use std::time::Duration;

use sentinel_core::{
    scoped_key, CacheEntry, CacheSettings, SentinelResult, SharedClock, StorageError,
    ValidationError,
};
use serde::{de::DeserializeOwned, Serialize};

use super::traits::{CacheBackend, CacheStats};

/// Generic key/value store with expiry.
///
/// A value is retrievable until `now >= created_at + ttl`; afterwards it
/// behaves exactly like a miss.
#[derive(Debug, Clone)]
pub struct TtlCacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: SharedClock,
    settings: CacheSettings,
}

impl TtlCacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: SharedClock, settings: CacheSettings) -> Self {
        Self {
            backend,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Get a reference to the cache backend.
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Store `value` under `key` for `ttl`, optionally tagged.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
        tags: &[&str],
    ) -> SentinelResult<()> {
        let entry = self.build_entry(self.global(key)?, value.into(), ttl, tags)?;
        self.backend.put(entry).await
    }

    /// Store with the configured default TTL.
    pub async fn set_default(&self, key: &str, value: impl Into<Vec<u8>>) -> SentinelResult<()> {
        self.set(key, value, self.settings.default_ttl, &[]).await
    }

    /// Store an entry owned by `tenant`. The key is namespaced so tenants
    /// never observe each other's values.
    pub async fn set_scoped(
        &self,
        tenant: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
        tags: &[&str],
    ) -> SentinelResult<()> {
        let entry = self
            .build_entry(self.tenant(tenant, key)?, value.into(), ttl, tags)?
            .with_tenant(tenant);
        self.backend.put(entry).await
    }

    /// Fetch a value; `None` is a miss.
    pub async fn get(&self, key: &str) -> SentinelResult<Option<Vec<u8>>> {
        Ok(self.get_entry(key).await?.map(|e| e.value))
    }

    /// Fetch a tenant-scoped value.
    pub async fn get_scoped(&self, tenant: &str, key: &str) -> SentinelResult<Option<Vec<u8>>> {
        let scoped = self.tenant(tenant, key)?;
        Ok(self.backend.get(&scoped).await?.map(|e| e.value))
    }

    /// Fetch the full entry with its metadata.
    pub async fn get_entry(&self, key: &str) -> SentinelResult<Option<CacheEntry>> {
        self.backend.get(&self.global(key)?).await
    }

    /// Delete a key. Returns whether a live value existed.
    pub async fn delete(&self, key: &str) -> SentinelResult<bool> {
        self.backend.delete(&self.global(key)?).await
    }

    /// Delete a tenant-scoped key.
    pub async fn delete_scoped(&self, tenant: &str, key: &str) -> SentinelResult<bool> {
        self.backend.delete(&self.tenant(tenant, key)?).await
    }

    pub async fn exists(&self, key: &str) -> SentinelResult<bool> {
        Ok(self.get_entry(key).await?.is_some())
    }

    /// Drop everything.
    pub async fn flush(&self) -> SentinelResult<u64> {
        let count = self.backend.flush().await?;
        tracing::info!(count, "Cache flushed");
        Ok(count)
    }

    /// Serialize `value` as JSON and store it.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> SentinelResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set(key, bytes, ttl, &[]).await
    }

    /// Fetch and deserialize a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> SentinelResult<Option<T>> {
        match self.get(key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                StorageError::Serialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
                .into()
            }),
        }
    }

    pub async fn invalidate_tag(&self, tag: &str) -> SentinelResult<u64> {
        self.backend.invalidate_tag(tag).await
    }

    pub async fn invalidate_tenant(&self, tenant: &str) -> SentinelResult<u64> {
        self.backend.invalidate_tenant(tenant).await
    }

    /// Physically drop expired entries.
    pub async fn purge_expired(&self) -> SentinelResult<u64> {
        self.backend.purge_expired("").await
    }

    pub async fn stats(&self) -> SentinelResult<CacheStats> {
        self.backend.stats().await
    }

    fn build_entry(
        &self,
        storage_key: String,
        value: Vec<u8>,
        ttl: Duration,
        tags: &[&str],
    ) -> SentinelResult<CacheEntry> {
        self.validate_ttl(ttl)?;
        if value.len() > self.settings.max_value_bytes {
            return Err(ValidationError::SizeLimitExceeded {
                field: "value".to_string(),
                size: value.len(),
                max: self.settings.max_value_bytes,
            }
            .into());
        }

        Ok(CacheEntry::new(storage_key, value, ttl, self.clock.now())
            .with_tags(tags.iter().map(|t| t.to_string()).collect()))
    }

    /// Backend key for a global `key`.
    fn global(&self, key: &str) -> SentinelResult<String> {
        self.validate_key(key)?;
        Ok(scoped_key(None, key))
    }

    /// Backend key for `key` owned by `tenant`.
    fn tenant(&self, tenant: &str, key: &str) -> SentinelResult<String> {
        if tenant.is_empty() || tenant.contains('/') {
            return Err(ValidationError::InvalidKey {
                reason: format!("tenant '{}' must be non-empty and contain no '/'", tenant),
            }
            .into());
        }
        self.validate_key(key)?;
        Ok(scoped_key(Some(tenant), key))
    }

    fn validate_key(&self, key: &str) -> SentinelResult<()> {
        if key.is_empty() {
            return Err(ValidationError::InvalidKey {
                reason: "key must not be empty".to_string(),
            }
            .into());
        }
        if key.len() > self.settings.max_key_bytes {
            return Err(ValidationError::SizeLimitExceeded {
                field: "key".to_string(),
                size: key.len(),
                max: self.settings.max_key_bytes,
            }
            .into());
        }
        Ok(())
    }

    fn validate_ttl(&self, ttl: Duration) -> SentinelResult<()> {
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
