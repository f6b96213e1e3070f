//! TTL cache layer.
//!
//! Everything else in SENTINEL is built on this module: locks and idempotency
//! records are cache entries like any other, relying on the backend's
//! set-if-absent and compare-and-swap primitives for atomicity.
//!
//! # Layering
//!
//! ```text
//! TtlCacheStore (validation, clock)
//!        │
//! StatsBackend (hit/miss/set/delete counters, optional)
//!        │
//! CacheBackend (InMemoryBackend, or a remote implementation)
//! ```

pub mod memory;
pub mod stats;
pub mod store;
pub mod traits;

pub use memory::InMemoryBackend;
pub use stats::{KeyStatsTable, StatsBackend};
pub use store::TtlCacheStore;
pub use traits::{CacheBackend, CacheStats, KeyStats};
