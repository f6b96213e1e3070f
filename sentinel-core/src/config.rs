//! Configuration types

use crate::constants::*;
use crate::error::ConfigError;
use crate::idempotency::FailedPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// TTL cache store limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// TTL applied when a caller does not specify one
    pub default_ttl: Duration,
    /// Largest TTL accepted by `set`
    pub max_ttl: Duration,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            max_ttl: Duration::from_secs(MAX_CACHE_TTL_SECS),
            max_key_bytes: DEFAULT_MAX_KEY_BYTES,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        }
    }
}

/// Statistics layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSettings {
    /// Cardinality cap for per-key hit/miss counters
    pub max_tracked_keys: usize,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }
}

/// Lock manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSettings {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            max_ttl: Duration::from_secs(MAX_LOCK_TTL_SECS),
        }
    }
}

/// Idempotency coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencySettings {
    /// Header carrying the client's idempotency key
    pub header_name: String,
    /// Reject mutating requests without a key instead of passing them through
    pub require_key: bool,
    pub default_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    /// Upper bound on how long a duplicate waits for an in-flight execution
    pub processing_wait_timeout: Duration,
    pub poll_interval: Duration,
    pub max_body_bytes: usize,
    pub failed_policy: FailedPolicy,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
            require_key: false,
            default_ttl: Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS),
            min_ttl: Duration::from_secs(MIN_IDEMPOTENCY_TTL_SECS),
            max_ttl: Duration::from_secs(MAX_IDEMPOTENCY_TTL_SECS),
            processing_wait_timeout: Duration::from_millis(DEFAULT_PROCESSING_WAIT_MS),
            poll_interval: Duration::from_millis(DEFAULT_PROCESSING_POLL_MS),
            max_body_bytes: MAX_BODY_HASH_SIZE,
            failed_policy: FailedPolicy::ReplayFailure,
        }
    }
}

/// Backoff strategy for DLQ retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential: initial * 2^attempt, capped at max
    Exponential { initial: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Delay before the retry following `attempt` failed retries.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Exponential { initial, max } => {
                let multiplier = 2u32.saturating_pow(attempt);
                initial.saturating_mul(multiplier).min(*max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial: Duration::from_secs(DEFAULT_DLQ_BACKOFF_INITIAL_SECS),
            max: Duration::from_secs(DEFAULT_DLQ_BACKOFF_MAX_SECS),
        }
    }
}

/// Dead-letter sweeper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqSettings {
    pub max_retries: u32,
    pub sweep_interval: Duration,
    pub batch_size: usize,
    pub backoff: BackoffStrategy,
    /// Lease held on an item while a retry is in progress
    pub claim_ttl: Duration,
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_DLQ_MAX_RETRIES,
            sweep_interval: Duration::from_secs(DEFAULT_DLQ_SWEEP_INTERVAL_SECS),
            batch_size: DEFAULT_DLQ_BATCH_SIZE,
            backoff: BackoffStrategy::default(),
            claim_ttl: Duration::from_secs(DEFAULT_DLQ_CLAIM_TTL_SECS),
        }
    }
}

/// Background job settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub idempotency_cleanup_interval: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            idempotency_cleanup_interval: Duration::from_secs(
                DEFAULT_IDEMPOTENCY_CLEANUP_INTERVAL_SECS,
            ),
        }
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SentinelConfig {
    pub cache: CacheSettings,
    pub stats: StatsSettings,
    pub locks: LockSettings,
    pub idempotency: IdempotencySettings,
    pub dlq: DlqSettings,
    pub jobs: JobSettings,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env_parse::<u64>(name)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env_parse::<u64>(name)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl SentinelConfig {
    /// Create SentinelConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `SENTINEL_CACHE_DEFAULT_TTL_SECS` / `SENTINEL_CACHE_MAX_TTL_SECS`
    /// - `SENTINEL_CACHE_MAX_KEY_BYTES` / `SENTINEL_CACHE_MAX_VALUE_BYTES`
    /// - `SENTINEL_STATS_MAX_TRACKED_KEYS`
    /// - `SENTINEL_LOCK_DEFAULT_TTL_SECS` / `SENTINEL_LOCK_MAX_TTL_SECS`
    /// - `SENTINEL_IDEMPOTENCY_HEADER` (default: idempotency-key)
    /// - `SENTINEL_IDEMPOTENCY_REQUIRE_KEY` (default: false)
    /// - `SENTINEL_IDEMPOTENCY_TTL_SECS` (default: 86400)
    /// - `SENTINEL_IDEMPOTENCY_WAIT_MS` / `SENTINEL_IDEMPOTENCY_POLL_MS`
    /// - `SENTINEL_IDEMPOTENCY_RETRY_FAILED` (default: false)
    /// - `SENTINEL_DLQ_MAX_RETRIES` (default: 5)
    /// - `SENTINEL_DLQ_SWEEP_INTERVAL_SECS` (default: 60)
    /// - `SENTINEL_DLQ_BATCH_SIZE` (default: 100)
    /// - `SENTINEL_IDEMPOTENCY_CLEANUP_INTERVAL_SECS` (default: 3600)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache = CacheSettings {
            default_ttl: env_secs("SENTINEL_CACHE_DEFAULT_TTL_SECS", defaults.cache.default_ttl),
            max_ttl: env_secs("SENTINEL_CACHE_MAX_TTL_SECS", defaults.cache.max_ttl),
            max_key_bytes: env_parse("SENTINEL_CACHE_MAX_KEY_BYTES")
                .unwrap_or(defaults.cache.max_key_bytes),
            max_value_bytes: env_parse("SENTINEL_CACHE_MAX_VALUE_BYTES")
                .unwrap_or(defaults.cache.max_value_bytes),
        };

        let stats = StatsSettings {
            max_tracked_keys: env_parse("SENTINEL_STATS_MAX_TRACKED_KEYS")
                .unwrap_or(defaults.stats.max_tracked_keys),
        };

        let locks = LockSettings {
            default_ttl: env_secs("SENTINEL_LOCK_DEFAULT_TTL_SECS", defaults.locks.default_ttl),
            max_ttl: env_secs("SENTINEL_LOCK_MAX_TTL_SECS", defaults.locks.max_ttl),
        };

        let failed_policy = match std::env::var("SENTINEL_IDEMPOTENCY_RETRY_FAILED")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Ok("true") | Ok("1") => FailedPolicy::RetryOnce,
            _ => defaults.idempotency.failed_policy,
        };

        let idempotency = IdempotencySettings {
            header_name: std::env::var("SENTINEL_IDEMPOTENCY_HEADER")
                .map(|s| s.to_lowercase())
                .unwrap_or(defaults.idempotency.header_name),
            require_key: std::env::var("SENTINEL_IDEMPOTENCY_REQUIRE_KEY")
                .ok()
                .map(|s| s.to_lowercase() == "true")
                .unwrap_or(defaults.idempotency.require_key),
            default_ttl: env_secs(
                "SENTINEL_IDEMPOTENCY_TTL_SECS",
                defaults.idempotency.default_ttl,
            ),
            processing_wait_timeout: env_millis(
                "SENTINEL_IDEMPOTENCY_WAIT_MS",
                defaults.idempotency.processing_wait_timeout,
            ),
            poll_interval: env_millis(
                "SENTINEL_IDEMPOTENCY_POLL_MS",
                defaults.idempotency.poll_interval,
            ),
            failed_policy,
            ..defaults.idempotency
        };

        let dlq = DlqSettings {
            max_retries: env_parse("SENTINEL_DLQ_MAX_RETRIES").unwrap_or(defaults.dlq.max_retries),
            sweep_interval: env_secs("SENTINEL_DLQ_SWEEP_INTERVAL_SECS", defaults.dlq.sweep_interval),
            batch_size: env_parse("SENTINEL_DLQ_BATCH_SIZE").unwrap_or(defaults.dlq.batch_size),
            ..defaults.dlq
        };

        let jobs = JobSettings {
            idempotency_cleanup_interval: env_secs(
                "SENTINEL_IDEMPOTENCY_CLEANUP_INTERVAL_SECS",
                defaults.jobs.idempotency_cleanup_interval,
            ),
        };

        Self {
            cache,
            stats,
            locks,
            idempotency,
            dlq,
            jobs,
        }
    }

    /// Create a configuration for development/testing with shorter timeouts.
    pub fn development() -> Self {
        let mut config = Self::default();
        config.idempotency.default_ttl = Duration::from_secs(600);
        config.idempotency.processing_wait_timeout = Duration::from_secs(2);
        config.dlq.sweep_interval = Duration::from_secs(10);
        config.dlq.batch_size = 10;
        config.dlq.backoff = BackoffStrategy::Fixed(Duration::from_secs(1));
        config.jobs.idempotency_cleanup_interval = Duration::from_secs(60);
        config
    }

    /// Create a configuration for production with longer retention.
    pub fn production() -> Self {
        let mut config = Self::default();
        config.idempotency.require_key = true;
        config.idempotency.processing_wait_timeout = Duration::from_secs(30);
        config
    }

    /// Check that bounds are internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ttl_bounds("cache", self.cache.default_ttl, Duration::ZERO, self.cache.max_ttl)?;
        check_ttl_bounds("locks", self.locks.default_ttl, Duration::ZERO, self.locks.max_ttl)?;
        check_ttl_bounds(
            "idempotency",
            self.idempotency.default_ttl,
            self.idempotency.min_ttl,
            self.idempotency.max_ttl,
        )?;

        if self.cache.max_key_bytes == 0 {
            return Err(invalid("cache.max_key_bytes", "0", "must be positive"));
        }
        if self.cache.max_value_bytes == 0 {
            return Err(invalid("cache.max_value_bytes", "0", "must be positive"));
        }
        if self.stats.max_tracked_keys == 0 {
            return Err(invalid("stats.max_tracked_keys", "0", "must be positive"));
        }
        if self.idempotency.header_name.trim().is_empty() {
            return Err(invalid("idempotency.header_name", "", "must not be empty"));
        }
        if self.idempotency.poll_interval.is_zero() {
            return Err(invalid("idempotency.poll_interval", "0", "must be positive"));
        }
        if self.idempotency.poll_interval > self.idempotency.processing_wait_timeout {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "idempotency.poll_interval".to_string(),
                option_b: "idempotency.processing_wait_timeout".to_string(),
            });
        }
        if self.dlq.sweep_interval.is_zero() {
            return Err(invalid("dlq.sweep_interval", "0", "must be positive"));
        }
        if self.dlq.batch_size == 0 {
            return Err(invalid("dlq.batch_size", "0", "must be positive"));
        }
        if self.dlq.claim_ttl.is_zero() {
            return Err(invalid("dlq.claim_ttl", "0", "must be positive"));
        }
        if self.jobs.idempotency_cleanup_interval.is_zero() {
            return Err(invalid("jobs.idempotency_cleanup_interval", "0", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn check_ttl_bounds(
    section: &str,
    default: Duration,
    min: Duration,
    max: Duration,
) -> Result<(), ConfigError> {
    if max.is_zero() {
        return Err(invalid(&format!("{section}.max_ttl"), "0", "must be positive"));
    }
    if default.is_zero() || default < min || default > max {
        return Err(invalid(
            &format!("{section}.default_ttl"),
            &format!("{:?}", default),
            &format!("must be within [{:?}, {:?}]", min.max(Duration::from_nanos(1)), max),
        ));
    }
    Ok(())
}
