//! Error types for SENTINEL operations
//!
//! Contention and ownership outcomes (busy locks, foreign owners, in-flight
//! idempotency records) are NOT errors; they are modelled as result values in
//! the coordination crate. Everything here is either a caller mistake or a
//! genuinely unexpected condition.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Input validation errors. Rejected synchronously, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("Invalid TTL {ttl:?}: must be greater than zero and at most {max:?}")]
    InvalidTtl { ttl: Duration, max: Duration },

    #[error("Size limit exceeded for {field}: {size} bytes (max {max})")]
    SizeLimitExceeded {
        field: String,
        size: usize,
        max: usize,
    },
}

/// Coordination errors surfaced by locks, idempotency and the DLQ.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("Idempotency key '{key}' was already used with a different request")]
    Conflict { key: String },

    #[error("Idempotency key '{key}' still processing after {waited:?}")]
    ProcessingTimeout { key: String, waited: Duration },

    #[error("Wait on '{key}' cancelled")]
    Cancelled { key: String },

    #[error("Stale token for '{key}': generation {generation} no longer owns the record")]
    StaleToken { key: String, generation: Uuid },

    #[error("Lock '{key}' is held by another owner")]
    LockBusy { key: String },

    #[error("Dead-letter item {id} exhausted after {attempts} attempts")]
    Exhausted { id: Uuid, attempts: u32 },
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Backend unavailable: {reason}")]
    Backend { reason: String },

    #[error("Serialization failed for '{key}': {reason}")]
    Serialization { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all SENTINEL errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SentinelError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SentinelError {
    /// Whether the caller may reasonably try the same request again later.
    ///
    /// Conflicts and validation failures are programming errors on the
    /// client side and are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SentinelError::Coordination(err) => matches!(
                err,
                CoordinationError::ProcessingTimeout { .. }
                    | CoordinationError::Cancelled { .. }
                    | CoordinationError::LockBusy { .. }
            ),
            SentinelError::Storage(StorageError::Backend { .. }) => true,
            _ => false,
        }
    }

    /// Whether this error means an idempotency key was reused incorrectly.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SentinelError::Coordination(CoordinationError::Conflict { .. })
        )
    }
}

/// Result type alias for SENTINEL operations.
pub type SentinelResult<T> = Result<T, SentinelError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_invalid_ttl() {
        let err = ValidationError::InvalidTtl {
            ttl: Duration::ZERO,
            max: Duration::from_secs(60),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid TTL"));
        assert!(msg.contains("60s"));
    }

    #[test]
    fn test_validation_error_display_size_limit() {
        let err = ValidationError::SizeLimitExceeded {
            field: "value".to_string(),
            size: 2048,
            max: 1024,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("value"));
        assert!(msg.contains("2048"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_coordination_error_display_conflict() {
        let err = CoordinationError::Conflict {
            key: "order-123".to_string(),
        };
        assert!(format!("{}", err).contains("order-123"));
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = SentinelError::from(CoordinationError::ProcessingTimeout {
            key: "k".to_string(),
            waited: Duration::from_secs(1),
        });
        assert!(timeout.is_retryable());
        assert!(!timeout.is_conflict());

        let conflict = SentinelError::from(CoordinationError::Conflict {
            key: "k".to_string(),
        });
        assert!(!conflict.is_retryable());
        assert!(conflict.is_conflict());

        let invalid = SentinelError::from(ValidationError::InvalidKey {
            reason: "empty".to_string(),
        });
        assert!(!invalid.is_retryable());

        let backend = SentinelError::from(StorageError::Backend {
            reason: "down".to_string(),
        });
        assert!(backend.is_retryable());
    }

    #[test]
    fn test_sentinel_error_from_variants() {
        let storage = SentinelError::from(StorageError::Serialization {
            key: "k".to_string(),
            reason: "eof".to_string(),
        });
        assert!(matches!(storage, SentinelError::Storage(_)));

        let config = SentinelError::from(ConfigError::InvalidValue {
            field: "ttl".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        });
        assert!(matches!(config, SentinelError::Config(_)));
    }
}
