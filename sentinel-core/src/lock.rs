//! Lease-based lock data.
//!
//! A lock is a time-bounded ownership grant. It stops being valid the moment
//! `now >= expires_at`, regardless of whether its owner still believes it
//! holds it. There is no heartbeat: a crashed holder's lease simply runs out.
//!
//! ```text
//! (free) ── acquire() ──→ Held ── release() ──→ (free)
//!                          │  ╲
//!                     renew() ↺ ╲── lease elapses ──→ (free)
//! ```

use crate::{expiry_after, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A lock as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLock {
    /// Unique per acquisition; a re-acquire after expiry gets a new id
    pub lock_id: EntityId,
    pub key: String,
    pub owner_id: String,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    pub ttl: Duration,
    pub auto_renew: bool,
    pub renew_count: u32,
}

impl CacheLock {
    /// A fresh lease starting at `now`.
    pub fn new(key: &str, owner_id: &str, ttl: Duration, now: Timestamp) -> Self {
        Self {
            lock_id: Uuid::now_v7(),
            key: key.to_string(),
            owner_id: owner_id.to_string(),
            acquired_at: now,
            expires_at: expiry_after(now, ttl),
            ttl,
            auto_renew: false,
            renew_count: 0,
        }
    }

    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }

    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Whether `owner_id` holds a live lease at `now`.
    pub fn is_held_by(&self, owner_id: &str, now: Timestamp) -> bool {
        !self.is_expired(now) && self.owner_id == owner_id
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// The same lease extended to `now + ttl`.
    ///
    /// Renewal extends from now, not from the previous expiry, so a late
    /// renew never grants more than one `ttl` of future ownership.
    pub fn renewed(&self, ttl: Duration, now: Timestamp) -> Self {
        Self {
            expires_at: expiry_after(now, ttl),
            ttl,
            renew_count: self.renew_count.saturating_add(1),
            ..self.clone()
        }
    }
}
