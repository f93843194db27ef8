//! # Configuration
//!
//! Explicit configuration structs for every component of the resilience
//! core. All fields are named, all defaults are documented on the field,
//! and construction-time validation rejects values that would make a
//! component misbehave silently (zero capacities, zero thresholds).
//!
//! The composition root deserializes these from its own config file and
//! passes them by value; this crate never reads the environment or the
//! filesystem for configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{require_nonzero_duration, ResilienceError, Result};

/// Cache sizing and expiry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Default time-to-live applied when `set` receives no override.
    /// Default: 5 minutes.
    #[serde(with = "duration_ms", default = "defaults::cache_ttl")]
    pub default_ttl: Duration,

    /// Maximum number of entries across all namespaces. Inserting beyond
    /// this evicts the oldest-inserted entry. Default: 1000.
    #[serde(default = "defaults::cache_max_items")]
    pub max_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: defaults::cache_ttl(),
            max_items: defaults::cache_max_items(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_items == 0 {
            return Err(ResilienceError::Configuration(
                "cache.max_items must be greater than zero".into(),
            ));
        }
        require_nonzero_duration(self.default_ttl, "cache.default_ttl")
    }
}

/// Thresholds for a single circuit breaker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerThresholds {
    /// Consecutive failures that open the circuit. Default: 5.
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before a half-open probe is allowed.
    /// Default: 30 seconds.
    #[serde(with = "duration_ms", default = "defaults::reset_timeout")]
    pub reset_timeout: Duration,

    /// Consecutive half-open successes that close the circuit. Default: 2.
    #[serde(default = "defaults::success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::failure_threshold(),
            reset_timeout: defaults::reset_timeout(),
            success_threshold: defaults::success_threshold(),
        }
    }
}

impl BreakerThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ResilienceError::Configuration(
                "breaker thresholds must be greater than zero".into(),
            ));
        }
        require_nonzero_duration(self.reset_timeout, "breaker.reset_timeout")
    }
}

/// Circuit breaker configuration: a default threshold set plus
/// per-operation overrides keyed by operation name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// Thresholds applied to operations without an explicit override.
    #[serde(default)]
    pub default_thresholds: BreakerThresholds,

    /// Per-operation threshold overrides.
    #[serde(default)]
    pub operation_thresholds: HashMap<String, BreakerThresholds>,
}

impl CircuitBreakerConfig {
    /// Thresholds for the named operation, falling back to the defaults.
    pub fn thresholds_for(&self, operation: &str) -> BreakerThresholds {
        self.operation_thresholds
            .get(operation)
            .cloned()
            .unwrap_or_else(|| self.default_thresholds.clone())
    }

    pub fn validate(&self) -> Result<()> {
        self.default_thresholds.validate()?;
        for (name, thresholds) in &self.operation_thresholds {
            thresholds.validate().map_err(|e| {
                ResilienceError::Configuration(format!("operation '{name}': {e}"))
            })?;
        }
        Ok(())
    }
}

/// Retry, backoff, and health-tracking settings for the degradation
/// controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DegradationConfig {
    /// Retries attempted after the initial call fails. Default: 3.
    #[serde(default = "defaults::max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Delay before the first retry. Default: 200ms.
    #[serde(with = "duration_ms", default = "defaults::initial_retry_delay")]
    pub initial_retry_delay: Duration,

    /// Upper bound on any single backoff delay. Default: 10 seconds.
    #[serde(with = "duration_ms", default = "defaults::max_retry_delay")]
    pub max_retry_delay: Duration,

    /// Multiplicative backoff factor. Default: 2.0.
    #[serde(default = "defaults::retry_backoff_factor")]
    pub retry_backoff_factor: f64,

    /// Consecutive failures before a component is considered degraded.
    /// Further multiples escalate the degradation level. Default: 3.
    #[serde(default = "defaults::component_failure_threshold")]
    pub component_failure_threshold: u32,

    /// Consecutive successes before a degraded component is considered
    /// healthy again. Default: 2.
    #[serde(default = "defaults::component_recovery_threshold")]
    pub component_recovery_threshold: u32,

    /// Interval of the periodic health-report loop. Default: 30 seconds.
    #[serde(with = "duration_ms", default = "defaults::health_check_interval")]
    pub health_check_interval: Duration,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: defaults::max_retry_attempts(),
            initial_retry_delay: defaults::initial_retry_delay(),
            max_retry_delay: defaults::max_retry_delay(),
            retry_backoff_factor: defaults::retry_backoff_factor(),
            component_failure_threshold: defaults::component_failure_threshold(),
            component_recovery_threshold: defaults::component_recovery_threshold(),
            health_check_interval: defaults::health_check_interval(),
        }
    }
}

impl DegradationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_backoff_factor < 1.0 {
            return Err(ResilienceError::Configuration(
                "degradation.retry_backoff_factor must be at least 1.0".into(),
            ));
        }
        if self.component_failure_threshold == 0 || self.component_recovery_threshold == 0 {
            return Err(ResilienceError::Configuration(
                "degradation component thresholds must be greater than zero".into(),
            ));
        }
        require_nonzero_duration(self.initial_retry_delay, "degradation.initial_retry_delay")?;
        require_nonzero_duration(self.max_retry_delay, "degradation.max_retry_delay")?;
        require_nonzero_duration(self.health_check_interval, "degradation.health_check_interval")
    }
}

/// Batching, paging, and memory-guard settings for the resource optimizer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerConfig {
    /// Coalescing window: requests for the same batch id arriving within
    /// this span share one executor invocation. Default: 50ms.
    #[serde(with = "duration_ms", default = "defaults::batch_window")]
    pub batch_window: Duration,

    /// Process memory ceiling. When exceeded the optimizer clears its
    /// cache and emits a memory-exceeded event. Default: 512 MiB.
    #[serde(default = "defaults::max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// Interval of the periodic memory check. Default: 30 seconds.
    #[serde(with = "duration_ms", default = "defaults::memory_check_interval")]
    pub memory_check_interval: Duration,

    /// Sizing of the optimizer's internal result cache.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            batch_window: defaults::batch_window(),
            max_memory_bytes: defaults::max_memory_bytes(),
            memory_check_interval: defaults::memory_check_interval(),
            cache: CacheConfig::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_bytes == 0 {
            return Err(ResilienceError::Configuration(
                "optimizer.max_memory_bytes must be greater than zero".into(),
            ));
        }
        require_nonzero_duration(self.batch_window, "optimizer.batch_window")?;
        require_nonzero_duration(self.memory_check_interval, "optimizer.memory_check_interval")?;
        self.cache.validate()
    }
}

/// Root configuration for the resilience core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub degradation: DegradationConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.circuit_breaker.validate()?;
        self.degradation.validate()?;
        self.optimizer.validate()
    }
}

/// Durations serialize as integer milliseconds so config files stay flat.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod defaults {
    use std::time::Duration;

    pub fn cache_ttl() -> Duration {
        Duration::from_secs(300)
    }
    pub fn cache_max_items() -> usize {
        1000
    }
    pub fn failure_threshold() -> u32 {
        5
    }
    pub fn reset_timeout() -> Duration {
        Duration::from_secs(30)
    }
    pub fn success_threshold() -> u32 {
        2
    }
    pub fn max_retry_attempts() -> u32 {
        3
    }
    pub fn initial_retry_delay() -> Duration {
        Duration::from_millis(200)
    }
    pub fn max_retry_delay() -> Duration {
        Duration::from_secs(10)
    }
    pub fn retry_backoff_factor() -> f64 {
        2.0
    }
    pub fn component_failure_threshold() -> u32 {
        3
    }
    pub fn component_recovery_threshold() -> u32 {
        2
    }
    pub fn health_check_interval() -> Duration {
        Duration::from_secs(30)
    }
    pub fn batch_window() -> Duration {
        Duration::from_millis(50)
    }
    pub fn max_memory_bytes() -> u64 {
        512 * 1024 * 1024
    }
    pub fn memory_check_interval() -> Duration {
        Duration::from_secs(30)
    }
}
