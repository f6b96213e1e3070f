//! Tracing Subscriber Initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! human-readable or a JSON formatting layer.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ApiError, ApiResult};

const DEFAULT_FILTER: &str = "sentinel_api=debug,sentinel_coord=info,info";

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Service name recorded on startup
    pub service_name: String,
    /// Filter directives, `RUST_LOG` syntax
    pub filter: String,
    /// Emit one JSON object per event
    pub json: bool,
}

impl TelemetryConfig {
    /// Build from an arbitrary variable lookup.
    ///
    /// # Environment Variables
    /// - `SENTINEL_SERVICE_NAME` (default: `sentinel`)
    /// - `RUST_LOG` (default: debug for this crate, info elsewhere)
    /// - `SENTINEL_LOG_JSON`: `true` or `1` for JSON output (default: false)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            service_name: lookup("SENTINEL_SERVICE_NAME").unwrap_or_else(|| "sentinel".to_string()),
            filter: lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            json: lookup("SENTINEL_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup. A second call returns an error rather than
/// replacing the installed subscriber.
pub fn init_tracing(config: &TelemetryConfig) -> ApiResult<()> {
    let env_filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| ApiError::internal_error(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(fmt::layer))
        .try_init()
        .map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        json = config.json,
        "Telemetry initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(config.service_name, "sentinel");
        assert_eq!(config.filter, DEFAULT_FILTER);
        assert!(!config.json);
    }

    #[test]
    fn test_telemetry_config_overrides() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("SENTINEL_SERVICE_NAME", "orders"),
            ("RUST_LOG", "warn"),
            ("SENTINEL_LOG_JSON", "1"),
        ]));
        assert_eq!(config.service_name, "orders");
        assert_eq!(config.filter, "warn");
        assert!(config.json);
    }

    #[test]
    fn test_init_tracing_rejects_bad_filter() {
        let config = TelemetryConfig {
            filter: "sentinel=notalevel".to_string(),
            ..TelemetryConfig::from_lookup(lookup(&[]))
        };
        assert!(init_tracing(&config).is_err());
    }
}
