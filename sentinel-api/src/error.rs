//! Error Types for the SENTINEL HTTP boundary
//!
//! - `ErrorCode` categorises failures and fixes their HTTP status
//! - `ApiError` is the JSON body every error response carries
//! - `From<SentinelError>` maps coordination outcomes onto status codes
//!
//! "Try again later" errors (in-flight records, busy locks, an unavailable
//! backend) carry a `Retry-After` header; key misuse never does.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sentinel_core::{CoordinationError, SentinelError, StorageError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400, 413, 422)
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    /// Required field or header is missing
    MissingField,

    /// Field format is incorrect
    InvalidFormat,

    /// Value is outside its allowed range
    InvalidRange,

    /// Request validation failed
    ValidationFailed,

    /// Request body exceeds the configured limit
    PayloadTooLarge,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Idempotency key reused with a different request
    IdempotencyKeyReused,

    /// Another request with this key is still executing
    IdempotencyInFlight,

    /// Resource is locked by another owner
    LockConflict,

    /// Operation conflicts with current state
    StateConflict,

    // ========================================================================
    // Server Errors (500, 503)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Service is temporarily unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::InvalidFormat
            | ErrorCode::InvalidRange => StatusCode::BAD_REQUEST,

            ErrorCode::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,

            ErrorCode::IdempotencyKeyReused
            | ErrorCode::IdempotencyInFlight
            | ErrorCode::LockConflict
            | ErrorCode::StateConflict => StatusCode::CONFLICT,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "Invalid input",
            ErrorCode::MissingField => "Required field missing",
            ErrorCode::InvalidFormat => "Invalid format",
            ErrorCode::InvalidRange => "Value out of range",
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::PayloadTooLarge => "Request body too large",
            ErrorCode::IdempotencyKeyReused => {
                "Idempotency key was already used with a different request"
            }
            ErrorCode::IdempotencyInFlight => "A request with this idempotency key is still processing",
            ErrorCode::LockConflict => "Resource is locked",
            ErrorCode::StateConflict => "Operation conflicts with current state",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Seconds a client should wait before retrying; sent as `Retry-After`
    #[serde(skip)]
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after_secs: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs.max(1));
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Header '{}' is required for this operation", field),
        )
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidFormat, message)
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            ErrorCode::PayloadTooLarge,
            format!("Request body exceeds {} bytes", limit),
        )
    }

    pub fn key_reused(key: &str) -> Self {
        Self::new(
            ErrorCode::IdempotencyKeyReused,
            format!(
                "Idempotency key '{}' was already used with a different request",
                key
            ),
        )
        .with_details(serde_json::json!({ "idempotency_key": key }))
    }

    pub fn in_flight(key: &str, retry_after_secs: u64) -> Self {
        Self::new(
            ErrorCode::IdempotencyInFlight,
            format!("Request with idempotency key '{}' is still processing", key),
        )
        .with_details(serde_json::json!({ "idempotency_key": key }))
        .with_retry_after(retry_after_secs)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after_secs;
        let mut response = (status, Json(self)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ============================================================================
// CONVERSIONS FROM SENTINEL ERRORS
// ============================================================================

impl From<SentinelError> for ApiError {
    fn from(err: SentinelError) -> Self {
        match err {
            SentinelError::Validation(err) => match err {
                ValidationError::InvalidKey { reason } => {
                    ApiError::invalid_format(format!("Invalid key: {}", reason))
                }
                ValidationError::InvalidTtl { .. } => {
                    ApiError::new(ErrorCode::InvalidRange, err.to_string())
                }
                ValidationError::SizeLimitExceeded { .. } => {
                    ApiError::new(ErrorCode::ValidationFailed, err.to_string())
                }
            },
            SentinelError::Coordination(err) => match err {
                CoordinationError::Conflict { key } => ApiError::key_reused(&key),
                CoordinationError::ProcessingTimeout { key, waited } => {
                    ApiError::in_flight(&key, waited.as_secs())
                }
                CoordinationError::Cancelled { .. } => {
                    ApiError::service_unavailable("Server is shutting down").with_retry_after(1)
                }
                CoordinationError::LockBusy { .. } => {
                    ApiError::new(ErrorCode::LockConflict, err.to_string()).with_retry_after(1)
                }
                CoordinationError::StaleToken { .. } | CoordinationError::Exhausted { .. } => {
                    ApiError::new(ErrorCode::StateConflict, err.to_string())
                }
            },
            SentinelError::Storage(StorageError::Backend { reason }) => {
                tracing::error!(error = %reason, "Cache backend unavailable");
                ApiError::service_unavailable("Cache backend unavailable").with_retry_after(1)
            }
            SentinelError::Storage(err @ StorageError::Serialization { .. }) => {
                tracing::error!(error = %err, "Stored record could not be decoded");
                ApiError::from_code(ErrorCode::InternalError)
            }
            SentinelError::Config(err) => {
                tracing::error!(error = %err, "Invalid configuration");
                ApiError::from_code(ErrorCode::InternalError)
            }
        }
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;
