//! SENTINEL Telemetry - Observability Infrastructure
//!
//! Structured logging through `tracing-subscriber` and a Prometheus-backed
//! [`sentinel_core::MetricsSink`].

pub mod metrics;
pub mod tracer;

pub use metrics::{metrics_handler, PrometheusMetrics, METRICS};
pub use tracer::{init_tracing, TelemetryConfig};
