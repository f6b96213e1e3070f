//! Prometheus Metrics
//!
//! [`PrometheusMetrics`] implements the core [`MetricsSink`] by counting every
//! [`Counter`] in one `IntCounterVec` labelled by component and outcome. Each
//! instance owns a private registry, so tests can create as many as they like.

use std::fmt;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use sentinel_core::{Counter, MetricsSink};

use crate::error::{ApiError, ApiResult};

/// Process-wide metrics instance - initialized once on first use
pub static METRICS: Lazy<ApiResult<Arc<PrometheusMetrics>>> =
    Lazy::new(|| PrometheusMetrics::new().map(Arc::new));

/// Coordination counters exported in the Prometheus text format.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,

    /// Coordination events - labels: component, outcome
    events_total: IntCounterVec,
}

impl PrometheusMetrics {
    /// Create and register all metrics on a fresh registry.
    pub fn new() -> ApiResult<Self> {
        let registry = Registry::new();
        let events_total = IntCounterVec::new(
            Opts::new(
                "sentinel_events_total",
                "Cache, lock, idempotency and dead-letter events",
            ),
            &["component", "outcome"],
        )
        .map_err(|e| ApiError::internal_error(format!("Failed to create events_total: {}", e)))?;

        registry
            .register(Box::new(events_total.clone()))
            .map_err(|e| {
                ApiError::internal_error(format!("Failed to register events_total: {}", e))
            })?;

        Ok(Self {
            registry,
            events_total,
        })
    }

    /// Current value of one counter.
    pub fn count(&self, counter: Counter) -> u64 {
        let (component, outcome) = counter.labels();
        self.events_total
            .with_label_values(&[component, outcome])
            .get()
    }

    /// Encode every registered metric in the text exposition format.
    pub fn render(&self) -> ApiResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| ApiError::internal_error(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| ApiError::internal_error(format!("Metrics are not UTF-8: {}", e)))
    }
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record(&self, counter: Counter) {
        let (component, outcome) = counter.labels();
        self.events_total
            .with_label_values(&[component, outcome])
            .inc();
    }
}

/// Handler for GET /metrics.
pub async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.message,
            )
        }
    }
}
