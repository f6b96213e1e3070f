//! Middleware modules for SENTINEL
//!
//! - `idempotency`: Idempotency key handling for safe retries
//!
//! # Middleware Order
//!
//! Tenancy is read from the `x-tenant-id` header, so any layer that sets or
//! rewrites it must run before idempotency:
//!
//! ```ignore
//! Router::new()
//!     .route("/orders", post(handler))
//!     // Innermost (runs last on request, first on response)
//!     .layer(middleware::from_fn_with_state(idempotency_state, idempotency_middleware))
//!     // Outermost
//!     .layer(middleware::from_fn(tenant_middleware))
//! ```

pub mod idempotency;

// Re-export idempotency types
pub use idempotency::{idempotency_middleware, IdempotencyError, IdempotencyState};
