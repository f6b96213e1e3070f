//! SENTINEL API - HTTP Boundary and Background Jobs
//!
//! This crate puts the SENTINEL coordination primitives behind an Axum
//! service: an idempotency middleware for mutating routes, a maintenance job
//! that sweeps the dead-letter queue and prunes expired idempotency records,
//! and Prometheus/`tracing` telemetry.

pub mod error;
pub mod jobs;
pub mod middleware;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorCode};
pub use jobs::{maintenance_task, MaintenanceConfig, MaintenanceMetrics, MaintenanceSnapshot};
pub use middleware::{idempotency_middleware, IdempotencyError, IdempotencyState};
pub use state::SentinelState;
pub use telemetry::{init_tracing, metrics_handler, PrometheusMetrics, TelemetryConfig, METRICS};
