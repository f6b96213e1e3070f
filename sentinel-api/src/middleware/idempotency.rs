//! Idempotency Middleware for SENTINEL
//!
//! Adds idempotency-key support to POST/PUT/PATCH/DELETE requests. A retried
//! request carrying the same key and the same request gets the original
//! response back instead of running the handler a second time.
//!
//! # Usage
//!
//! Clients send an `Idempotency-Key` header (typically a UUID) on mutating
//! requests. For each keyed request the middleware:
//!
//! 1. Fingerprints method + path + query + body
//! 2. First request for the key: runs the handler once and stores the response
//! 3. Same key, same fingerprint: replays the stored response verbatim
//! 4. Same key, different fingerprint: 409 `IDEMPOTENCY_KEY_REUSED`
//! 5. Same key still executing past the wait bound: 409 `IDEMPOTENCY_IN_FLIGHT`
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, middleware};
//! use sentinel_api::middleware::{idempotency_middleware, IdempotencyState};
//!
//! let state = IdempotencyState::new(coordinator);
//!
//! let app = Router::new()
//!     .route("/orders", axum::routing::post(create_order))
//!     .layer(middleware::from_fn_with_state(state, idempotency_middleware));
//! ```

use crate::error::{ApiError, ErrorCode};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sentinel_core::constants::{
    IDEMPOTENCY_REPLAY_HEADER, MAX_IDEMPOTENCY_KEY_LEN, MAX_TENANT_ID_LEN, TENANT_HEADER,
};
use sentinel_core::{
    scoped_key, CoordinationError, Fingerprint, IdempotencySettings, SentinelError, StoredResponse,
};
use sentinel_coord::{Execution, IdempotencyCoordinator, RecordedOutcome, RequestMeta};
use tokio::sync::watch;

// ============================================================================
// STATE
// ============================================================================

/// Shared state for idempotency middleware.
#[derive(Debug, Clone)]
pub struct IdempotencyState {
    /// Coordinator holding the per-key records
    pub coordinator: IdempotencyCoordinator,

    /// Flips to `true` on shutdown so waiting duplicates give up
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl IdempotencyState {
    pub fn new(coordinator: IdempotencyCoordinator) -> Self {
        Self {
            coordinator,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &IdempotencySettings {
        self.coordinator.settings()
    }
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

/// Axum middleware for idempotency key handling.
///
/// GET, HEAD and other safe methods pass through unchanged, as do mutating
/// requests without a key unless `require_key` is set.
pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    request: Request,
    next: Next,
) -> Result<Response, IdempotencyError> {
    let method = request.method().clone();
    if !is_mutating_method(&method) {
        return Ok(next.run(request).await);
    }

    let config = state.config();
    let client_key = match request.headers().get(config.header_name.as_str()) {
        Some(value) => validate_client_key(value)?,
        None => {
            if config.require_key {
                return Err(IdempotencyError::MissingKey(config.header_name.clone()));
            }
            return Ok(next.run(request).await);
        }
    };
    let tenant = match request.headers().get(TENANT_HEADER) {
        Some(value) => Some(validate_tenant(value)?),
        None => None,
    };

    // Buffer the request body for hashing
    let max_body = config.max_body_bytes;
    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, max_body)
        .await
        .map_err(|_| IdempotencyError::BodyTooLarge(max_body))?;

    let fingerprint = Fingerprint::from_request(
        method.as_str(),
        parts.uri.path(),
        parts.uri.query(),
        &body_bytes,
    );
    let key = scoped_key(tenant.as_deref(), &client_key);
    let meta = RequestMeta {
        method: Some(method.as_str().to_string()),
        path: Some(parts.uri.path().to_string()),
        client_id: tenant,
        ttl: None,
    };

    let execution = state
        .coordinator
        .execute_with(&key, &fingerprint, &meta, state.shutdown.clone(), move || async move {
            let request = Request::from_parts(parts, Body::from(body_bytes));
            capture(next.run(request).await, max_body).await
        })
        .await
        .map_err(|err| IdempotencyError::from_coordination(err, &client_key, config))?;

    let replay = execution.is_replay();
    if replay {
        tracing::debug!(
            idempotency_key = %client_key,
            "Returning stored response for idempotency key"
        );
    }

    match execution {
        Execution::Executed(outcome) | Execution::Replayed(outcome) => match outcome {
            RecordedOutcome::Completed(response)
            | RecordedOutcome::Failed {
                response: Some(response),
                ..
            } => build_response(&response, replay),
            RecordedOutcome::Failed {
                error,
                response: None,
            } => Err(IdempotencyError::Internal(error)),
        },
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Check if the HTTP method is a mutating operation.
fn is_mutating_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn validate_client_key(value: &HeaderValue) -> Result<String, IdempotencyError> {
    let key = value.to_str().map_err(|_| {
        IdempotencyError::InvalidKey("Idempotency key must be visible ASCII".to_string())
    })?;
    if key.is_empty() || key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(IdempotencyError::InvalidKey(format!(
            "Idempotency key must be 1-{} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(key.to_string())
}

fn validate_tenant(value: &HeaderValue) -> Result<String, IdempotencyError> {
    match value.to_str() {
        Ok(tenant)
            if !tenant.is_empty() && tenant.len() <= MAX_TENANT_ID_LEN && !tenant.contains('/') =>
        {
            Ok(tenant.to_string())
        }
        _ => Err(IdempotencyError::InvalidTenant(format!(
            "Header '{}' must be 1-{} characters without '/'",
            TENANT_HEADER, MAX_TENANT_ID_LEN
        ))),
    }
}

/// Buffer a handler response into its stored form.
///
/// Anything below 500 completes the record; server errors fail it. A body
/// over `limit` bytes fails the record without a response, which the client
/// sees as a 500.
async fn capture(response: Response, limit: usize) -> RecordedOutcome {
    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(limit, error = %e, "Response not stored for idempotent replay");
            return RecordedOutcome::Failed {
                error: format!("Failed to buffer response body within {} bytes: {}", limit, e),
                response: None,
            };
        }
    };

    let stored = parts.headers.iter().fold(
        StoredResponse::new(parts.status.as_u16(), bytes.to_vec()),
        |stored, (name, value)| stored.with_header(name.as_str(), value.as_bytes()),
    );

    if parts.status.is_server_error() {
        RecordedOutcome::Failed {
            error: format!("Handler returned {}", parts.status),
            response: Some(stored),
        }
    } else {
        RecordedOutcome::Completed(stored)
    }
}

/// Rebuild an HTTP response from its stored form.
fn build_response(stored: &StoredResponse, replay: bool) -> Result<Response, IdempotencyError> {
    let status = StatusCode::from_u16(stored.status_code)
        .map_err(|e| IdempotencyError::Internal(format!("Stored status is invalid: {}", e)))?;

    let mut builder = Response::builder().status(status);
    for header in &stored.headers {
        let value = HeaderValue::from_bytes(&header.value).map_err(|e| {
            IdempotencyError::Internal(format!("Stored header '{}' is invalid: {}", header.name, e))
        })?;
        builder = builder.header(header.name.as_str(), value);
    }
    if replay {
        builder = builder.header(
            HeaderName::from_static(IDEMPOTENCY_REPLAY_HEADER),
            HeaderValue::from_static("true"),
        );
    }

    builder
        .body(Body::from(stored.body.clone()))
        .map_err(|e| IdempotencyError::Internal(format!("Failed to build response: {}", e)))
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Errors that can occur in idempotency middleware.
#[derive(Debug)]
pub enum IdempotencyError {
    /// Idempotency key is required but not provided; carries the header name
    MissingKey(String),

    /// Idempotency key format is invalid
    InvalidKey(String),

    /// Tenant header is malformed
    InvalidTenant(String),

    /// Request body is larger than the hashing limit
    BodyTooLarge(usize),

    /// Key exists but the request fingerprint differs
    Conflict(String),

    /// Another request with the key is still executing
    InFlight { key: String, retry_after_secs: u64 },

    /// Shutdown interrupted the wait for an in-flight request
    Cancelled,

    /// Internal error (backend, serialization, etc.)
    Internal(String),
}

impl IdempotencyError {
    fn from_coordination(err: SentinelError, key: &str, config: &IdempotencySettings) -> Self {
        match err {
            SentinelError::Coordination(CoordinationError::Conflict { .. }) => {
                IdempotencyError::Conflict(key.to_string())
            }
            SentinelError::Coordination(CoordinationError::ProcessingTimeout { .. }) => {
                IdempotencyError::InFlight {
                    key: key.to_string(),
                    retry_after_secs: config.processing_wait_timeout.as_secs(),
                }
            }
            SentinelError::Coordination(CoordinationError::Cancelled { .. }) => {
                IdempotencyError::Cancelled
            }
            SentinelError::Validation(err) => IdempotencyError::InvalidKey(err.to_string()),
            other => IdempotencyError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        let error = match self {
            IdempotencyError::MissingKey(header) => ApiError::missing_field(&header),
            IdempotencyError::InvalidKey(msg) => ApiError::invalid_format(msg),
            IdempotencyError::InvalidTenant(msg) => ApiError::new(ErrorCode::InvalidInput, msg),
            IdempotencyError::BodyTooLarge(limit) => ApiError::payload_too_large(limit),
            IdempotencyError::Conflict(key) => ApiError::key_reused(&key),
            IdempotencyError::InFlight {
                key,
                retry_after_secs,
            } => ApiError::in_flight(&key, retry_after_secs),
            IdempotencyError::Cancelled => {
                ApiError::service_unavailable("Server is shutting down").with_retry_after(1)
            }
            IdempotencyError::Internal(msg) => {
                tracing::error!(error = %msg, "Idempotency middleware internal error");
                ApiError::from_code(ErrorCode::InternalError)
            }
        };

        error.into_response()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_mutating_method() {
        assert!(is_mutating_method(&Method::POST));
        assert!(is_mutating_method(&Method::PUT));
        assert!(is_mutating_method(&Method::PATCH));
        assert!(is_mutating_method(&Method::DELETE));
        assert!(!is_mutating_method(&Method::GET));
        assert!(!is_mutating_method(&Method::HEAD));
        assert!(!is_mutating_method(&Method::OPTIONS));
    }

    #[test]
    fn test_validate_client_key_bounds() {
        assert!(validate_client_key(&HeaderValue::from_static("order-123")).is_ok());
        assert!(matches!(
            validate_client_key(&HeaderValue::from_static("")),
            Err(IdempotencyError::InvalidKey(_))
        ));
        let long = "k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1);
        let value = HeaderValue::from_str(&long).expect("ascii header");
        assert!(matches!(
            validate_client_key(&value),
            Err(IdempotencyError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_validate_tenant_rejects_separator() {
        assert_eq!(
            validate_tenant(&HeaderValue::from_static("acme")).ok(),
            Some("acme".to_string())
        );
        assert!(validate_tenant(&HeaderValue::from_static("a/b")).is_err());
        assert!(validate_tenant(&HeaderValue::from_static("")).is_err());
    }

    #[tokio::test]
    async fn test_capture_classifies_by_status() {
        let ok = Response::builder()
            .status(StatusCode::CREATED)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"id":1}"#))
            .expect("valid response");
        match capture(ok, 1024).await {
            RecordedOutcome::Completed(stored) => {
                assert_eq!(stored.status_code, 201);
                assert_eq!(stored.body, br#"{"id":1}"#.to_vec());
                assert_eq!(stored.header("content-type"), Some(&b"application/json"[..]));
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        let failed = Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(Body::empty())
            .expect("valid response");
        assert!(matches!(
            capture(failed, 1024).await,
            RecordedOutcome::Failed { response: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_capture_refuses_oversized_body() {
        let large = Response::builder()
            .status(StatusCode::OK)
            .body(Body::from(vec![b'x'; 65]))
            .expect("valid response");
        assert!(matches!(
            capture(large, 64).await,
            RecordedOutcome::Failed { response: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_non_utf8_header_survives_replay() {
        let raw = HeaderValue::from_bytes(&[b'a', 0xe9, b'b']).expect("opaque header bytes");
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .header("x-legacy", raw.clone())
            .body(Body::empty())
            .expect("valid response");

        let stored = match capture(response, 1024).await {
            RecordedOutcome::Completed(stored) => stored,
            other => panic!("expected Completed, got {:?}", other),
        };
        assert_eq!(stored.header("x-legacy"), Some(&[b'a', 0xe9, b'b'][..]));

        let replayed = build_response(&stored, true).expect("valid stored response");
        assert_eq!(replayed.headers().get("x-legacy"), Some(&raw));
    }

    #[test]
    fn test_build_response_marks_replays() {
        let stored = StoredResponse::new(201, b"{}".to_vec()).with_header("x-order", "1");

        let fresh = build_response(&stored, false).expect("valid stored response");
        assert!(fresh.headers().get(IDEMPOTENCY_REPLAY_HEADER).is_none());

        let replayed = build_response(&stored, true).expect("valid stored response");
        assert_eq!(replayed.status(), StatusCode::CREATED);
        assert_eq!(
            replayed.headers().get(IDEMPOTENCY_REPLAY_HEADER),
            Some(&HeaderValue::from_static("true"))
        );
        assert_eq!(
            replayed.headers().get("x-order"),
            Some(&HeaderValue::from_static("1"))
        );
    }

    #[test]
    fn test_in_flight_error_sets_retry_after() {
        let response = IdempotencyError::InFlight {
            key: "k".to_string(),
            retry_after_secs: 3,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(axum::http::header::RETRY_AFTER),
            Some(&HeaderValue::from(3u64))
        );
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use sentinel_test_utils::generators::{arb_idempotency_key, arb_tenant_id};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Every well-formed client key is accepted unchanged
        #[test]
        fn prop_valid_keys_accepted(key in arb_idempotency_key()) {
            let value = HeaderValue::from_str(&key).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(validate_client_key(&value).ok(), Some(key));
        }

        /// Distinct tenants never share a scoped key
        #[test]
        fn prop_tenants_are_isolated(
            key in arb_idempotency_key(),
            a in arb_tenant_id(),
            b in arb_tenant_id(),
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(scoped_key(Some(&a), &key), scoped_key(Some(&b), &key));
        }

        /// A key without a tenant never lands in a tenant's namespace
        #[test]
        fn prop_global_keys_never_alias_tenants(
            key in arb_idempotency_key(),
            tenant in arb_tenant_id(),
        ) {
            let forged = format!("t/{}/{}", tenant, key);
            prop_assert_ne!(scoped_key(None, &forged), scoped_key(Some(&tenant), &key));
        }
    }
}
