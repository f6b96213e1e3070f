//! Constants for SENTINEL
//!
//! Centralizing defaults makes them easy to find, modify, and test.

// ============================================================================
// CACHE STORE
// ============================================================================

/// Default TTL for cache entries in seconds (5 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Maximum TTL for cache entries in seconds (7 days)
pub const MAX_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Maximum key length in bytes
pub const DEFAULT_MAX_KEY_BYTES: usize = 512;

/// Maximum value size in bytes (1MB)
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Upper bound on distinct keys tracked by per-key statistics
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 1024;

/// Upper bound on independently locked shards in the per-key stats table.
pub const MAX_STATS_SHARDS: usize = 16;

/// Smallest per-shard capacity; smaller tables use fewer shards.
pub const MIN_KEYS_PER_STATS_SHARD: usize = 64;

/// Namespace for tenant-owned keys: `t/{tenant}/{key}`.
pub const TENANT_KEY_PREFIX: &str = "t/";

/// Namespace for keys with no tenant: `g/{key}`.
pub const GLOBAL_KEY_PREFIX: &str = "g/";

// ============================================================================
// LOCKS
// ============================================================================

/// Default lease length in seconds
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;

/// Maximum lease length in seconds (1 hour)
pub const MAX_LOCK_TTL_SECS: u64 = 3600;

/// Key prefix for lock entries
pub const LOCK_KEY_PREFIX: &str = "lock:";

// ============================================================================
// IDEMPOTENCY
// ============================================================================

/// Header name for idempotency key
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Header marking a replayed response
pub const IDEMPOTENCY_REPLAY_HEADER: &str = "x-idempotency-replay";

/// Optional header scoping idempotency keys per tenant
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Default TTL for idempotency records in seconds (24 hours)
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

/// Minimum TTL for idempotency records in seconds
pub const MIN_IDEMPOTENCY_TTL_SECS: u64 = 60;

/// Maximum TTL for idempotency records in seconds (7 days)
pub const MAX_IDEMPOTENCY_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Maximum idempotency key length
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

/// Maximum tenant identifier length accepted from the tenant header
pub const MAX_TENANT_ID_LEN: usize = 128;

/// How long a caller waits on an in-flight record before giving up (ms)
pub const DEFAULT_PROCESSING_WAIT_MS: u64 = 10_000;

/// Poll interval while waiting on an in-flight record (ms)
pub const DEFAULT_PROCESSING_POLL_MS: u64 = 50;

/// Maximum request/response body size considered by the middleware (1MB)
pub const MAX_BODY_HASH_SIZE: usize = 1024 * 1024;

/// Key prefix for idempotency records
pub const IDEMPOTENCY_KEY_PREFIX: &str = "idem:";

// ============================================================================
// DEAD-LETTER QUEUE
// ============================================================================

/// Maximum retries for a dead-lettered item
pub const DEFAULT_DLQ_MAX_RETRIES: u32 = 5;

/// Sweep interval in seconds
pub const DEFAULT_DLQ_SWEEP_INTERVAL_SECS: u64 = 60;

/// Items processed per sweep
pub const DEFAULT_DLQ_BATCH_SIZE: usize = 100;

/// Initial backoff in seconds
pub const DEFAULT_DLQ_BACKOFF_INITIAL_SECS: u64 = 10;

/// Backoff ceiling in seconds (1 hour)
pub const DEFAULT_DLQ_BACKOFF_MAX_SECS: u64 = 3600;

/// Lease held on an item while it is being retried
pub const DEFAULT_DLQ_CLAIM_TTL_SECS: u64 = 30;

/// Key prefix for DLQ claim locks
pub const DLQ_CLAIM_PREFIX: &str = "dlq:";

// ============================================================================
// COORDINATION
// ============================================================================

/// Upper bound on read/compare-and-swap rounds before contention is reported
pub const MAX_CAS_ATTEMPTS: usize = 16;

// ============================================================================
// JOBS
// ============================================================================

/// How often expired idempotency records are reclaimed (1 hour)
pub const DEFAULT_IDEMPOTENCY_CLEANUP_INTERVAL_SECS: u64 = 3600;
