//! Dead-letter queue item.

use crate::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An asynchronous operation that failed and awaits bounded retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub id: EntityId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub first_failed_at: Timestamp,
    /// Re-dispatch attempts made so far; only ever increases
    pub retry_count: u32,
    pub last_error: String,
    pub next_retry_at: Timestamp,
}

impl FailedEvent {
    /// A freshly dead-lettered operation, eligible for retry immediately.
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        error: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
            first_failed_at: now,
            retry_count: 0,
            last_error: error.into(),
            next_retry_at: now,
        }
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        now >= self.next_retry_at
    }

    /// Total attempts including the original failed execution.
    pub fn total_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_new_failed_event_is_due() {
        let now = Utc::now();
        let event = FailedEvent::new("order.created", serde_json::json!({"id": 1}), "boom", now);
        assert!(event.is_due(now));
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.total_attempts(), 1);
        assert_eq!(event.last_error, "boom");
    }
}
