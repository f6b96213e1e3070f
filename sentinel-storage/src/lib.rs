//! SENTINEL Storage - Cache Backend Trait and In-Memory Implementation
//!
//! Defines the key/value abstraction every coordination primitive sits on.

pub mod cache;

pub use cache::{
    CacheBackend, CacheStats, InMemoryBackend, KeyStats, KeyStatsTable, StatsBackend,
    TtlCacheStore,
};
