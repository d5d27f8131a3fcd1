//! Engine configuration.
//!
//! Every tunable from the deployment surface lives here, with production
//! defaults, a collapsed test profile, and an env-var loader. All durations
//! cross the config edge as milliseconds and live as `Duration` inside;
//! malformed values fall back to their defaults with a warning rather than
//! failing startup.

use crate::cache::CacheSettings;
use crate::circuit_breaker::CircuitBreakerConfig;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Retry tuning for role calls.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Overall budget for one ensemble request.
    pub ensemble_deadline: Duration,
    /// Budget for one role task; clamped to the ensemble deadline.
    pub role_deadline: Duration,
    pub retry: RetrySettings,
    pub breaker: CircuitBreakerConfig,
    pub cache: CacheSettings,
    pub auto_recovery_enabled: bool,
    pub graceful_degradation_enabled: bool,
    pub recovery_interval: Duration,
    /// Concurrent ensemble requests admitted before shedding load.
    pub max_concurrent_requests: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ensemble_deadline: Duration::from_millis(30_000),
            role_deadline: Duration::from_millis(25_000),
            retry: RetrySettings::default(),
            breaker: CircuitBreakerConfig::default(),
            cache: CacheSettings::default(),
            auto_recovery_enabled: true,
            graceful_degradation_enabled: true,
            recovery_interval: Duration::from_secs(60),
            max_concurrent_requests: 100,
        }
    }
}

impl EngineConfig {
    /// Test profile: single retry attempt with ~10 ms delay, fast breaker
    /// reset, small windows. Keeps test suites off real clocks.
    pub fn test() -> Self {
        Self {
            retry: RetrySettings {
                max_attempts: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
                jitter: Duration::ZERO,
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: 10,
                reset_timeout: Duration::from_millis(1_000),
                monitor_window: Duration::from_millis(5_000),
            },
            ..Self::default()
        }
    }

    /// Like [`EngineConfig::from_env`] but rejects malformed values instead
    /// of warning. For deployments that prefer failing fast at startup.
    pub fn from_env_strict() -> Result<Self, ConfigError> {
        for var in [
            "ENSEMBLE_DEADLINE_MS",
            "ROLE_DEADLINE_MS",
            "RETRY_MAX_ATTEMPTS",
            "RETRY_BASE_DELAY_MS",
            "RETRY_MAX_DELAY_MS",
            "BREAKER_FAILURE_THRESHOLD",
            "BREAKER_RESET_MS",
            "BREAKER_WINDOW_MS",
            "CACHE_MAX_MEMORY_MB",
            "CACHE_COMPRESS_THRESHOLD_BYTES",
            "CACHE_TIER_MAX_HOT",
            "CACHE_TIER_MAX_WARM",
            "CACHE_TIER_MAX_COLD",
            "CACHE_TTL_HOT_MS",
            "CACHE_TTL_WARM_MS",
            "CACHE_TTL_COLD_MS",
            "ENSEMBLE_MAX_CONCURRENT",
        ] {
            if let Ok(raw) = std::env::var(var) {
                if raw.parse::<u64>().is_err() {
                    return Err(ConfigError::InvalidValue { var, value: raw });
                }
            }
        }
        Ok(Self::from_env())
    }

    /// Load from environment variables, falling back to defaults for unset
    /// or malformed values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ensemble_deadline: env_millis("ENSEMBLE_DEADLINE_MS", defaults.ensemble_deadline),
            role_deadline: env_millis("ROLE_DEADLINE_MS", defaults.role_deadline),
            retry: RetrySettings {
                max_attempts: env_usize("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                base_delay: env_millis("RETRY_BASE_DELAY_MS", defaults.retry.base_delay),
                max_delay: env_millis("RETRY_MAX_DELAY_MS", defaults.retry.max_delay),
                multiplier: defaults.retry.multiplier,
                jitter: env_millis("RETRY_JITTER_MS", defaults.retry.jitter),
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: env_usize(
                    "BREAKER_FAILURE_THRESHOLD",
                    defaults.breaker.failure_threshold,
                ),
                reset_timeout: env_millis("BREAKER_RESET_MS", defaults.breaker.reset_timeout),
                monitor_window: env_millis("BREAKER_WINDOW_MS", defaults.breaker.monitor_window),
            },
            cache: CacheSettings {
                max_memory_bytes: env_usize(
                    "CACHE_MAX_MEMORY_MB",
                    defaults.cache.max_memory_bytes / (1024 * 1024),
                ) * 1024
                    * 1024,
                compression_threshold: env_usize(
                    "CACHE_COMPRESS_THRESHOLD_BYTES",
                    defaults.cache.compression_threshold,
                ),
                hot_capacity: env_usize("CACHE_TIER_MAX_HOT", defaults.cache.hot_capacity),
                warm_capacity: env_usize("CACHE_TIER_MAX_WARM", defaults.cache.warm_capacity),
                cold_capacity: env_usize("CACHE_TIER_MAX_COLD", defaults.cache.cold_capacity),
                hot_ttl: env_millis("CACHE_TTL_HOT_MS", defaults.cache.hot_ttl),
                warm_ttl: env_millis("CACHE_TTL_WARM_MS", defaults.cache.warm_ttl),
                cold_ttl: env_millis("CACHE_TTL_COLD_MS", defaults.cache.cold_ttl),
                stale_after: defaults.cache.stale_after,
                maintenance_interval: defaults.cache.maintenance_interval,
            },
            auto_recovery_enabled: env_bool("AUTO_RECOVERY_ENABLED", defaults.auto_recovery_enabled),
            graceful_degradation_enabled: env_bool(
                "GRACEFUL_DEGRADATION_ENABLED",
                defaults.graceful_degradation_enabled,
            ),
            recovery_interval: defaults.recovery_interval,
            max_concurrent_requests: env_usize(
                "ENSEMBLE_MAX_CONCURRENT",
                defaults.max_concurrent_requests,
            ),
        }
    }
}

fn env_millis(var: &str, default: Duration) -> Duration {
    match std::env::var(var) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                tracing::warn!(var, value = %raw, "malformed duration, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_usize(var: &str, default: usize) -> usize {
    match std::env::var(var) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                tracing::warn!(var, value = %raw, "malformed integer, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                tracing::warn!(var, value = other, "malformed boolean, using default");
                default
            }
        },
        Err(_) => default,
    }
}
