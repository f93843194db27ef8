//! # Graceful Degradation Controller
//!
//! Orchestrates the fault-tolerant request-execution pipeline: primary
//! execution through a named circuit breaker, retry with multiplicative
//! backoff, a cache tier, a registered-fallback tier, and per-component
//! health tracking with hysteresis.
//!
//! Tier order for [`DegradationController::execute_with_fallback`]:
//!
//! 1. Fast path: breaker already open and a valid cache entry exists,
//!    so serve from cache without touching the upstream.
//! 2. Primary: invoke the executor through the breaker; on failure retry
//!    with `initial_retry_delay * retry_backoff_factor^attempt` (capped at
//!    `max_retry_delay`), up to `max_retry_attempts` additional attempts,
//!    strictly sequentially.
//! 3. Cache: a valid entry under the operation's namespace.
//! 4. Fallback: the registered fallback function, if any.
//! 5. [`ResilienceError::ServiceDegraded`] carrying the last upstream
//!    error. This applies to critical AND non-critical operations: a typed
//!    API cannot fabricate a neutral value, so exhaustion always raises.
//!    Criticality instead weights [`DegradationController::overall_health`].
//!
//! Retries and tier substitution are invisible to callers except through
//! elapsed time and the `source`/`degraded` fields of the response.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ResponseCache;
use crate::config::{CircuitBreakerConfig, DegradationConfig};
use crate::error::{BoxError, ResilienceError, Result};

use super::circuit_breaker::CircuitState;
use super::metrics::MetricsSink;
use super::registry::CircuitBreakerRegistry;

/// Qualitative severity tier for a component, escalating with consecutive
/// failures and recovering only after sustained success (hysteresis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealthStatus {
    Healthy,
    PartiallyDegraded,
    SeverelyDegraded,
    Unavailable,
}

impl ServiceHealthStatus {
    /// Numeric encoding for status gauges (0 = healthy .. 3 = unavailable).
    pub fn as_gauge(&self) -> f64 {
        *self as u8 as f64
    }
}

impl std::fmt::Display for ServiceHealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceHealthStatus::Healthy => write!(f, "healthy"),
            ServiceHealthStatus::PartiallyDegraded => write!(f, "partially_degraded"),
            ServiceHealthStatus::SeverelyDegraded => write!(f, "severely_degraded"),
            ServiceHealthStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Health record for one named operation.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ServiceHealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_change_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ServiceHealthStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_change_at: Utc::now(),
        }
    }
}

/// Boxed async fallback producer.
pub type FallbackFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Value, BoxError>> + Send + Sync>;

/// Fallback registration for one operation. At most one per operation
/// name; re-registration replaces.
#[derive(Clone)]
pub struct FallbackConfig {
    /// Substitute data producer. `None` registers criticality and cache
    /// TTL policy for an operation that has no fallback path.
    pub fallback: Option<FallbackFn>,
    /// Critical operations weight the overall-health roll-up: an
    /// unavailable critical component forces overall Unavailable.
    pub critical: bool,
    /// TTL applied when caching this operation's successful results,
    /// unless the call site overrides it.
    pub cache_ttl: Option<Duration>,
}

impl FallbackConfig {
    /// Registration with a fallback producer.
    pub fn with_fallback<F, Fut>(fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            fallback: Some(Arc::new(move || Box::pin(fallback()))),
            critical: false,
            cache_ttl: None,
        }
    }

    /// Registration carrying only policy (criticality, cache TTL).
    pub fn policy_only() -> Self {
        Self {
            fallback: None,
            critical: false,
            cache_ttl: None,
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

impl std::fmt::Debug for FallbackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackConfig")
            .field("fallback", &self.fallback.is_some())
            .field("critical", &self.critical)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

/// Per-call options for [`DegradationController::execute_with_fallback`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Cache key for this call's result within the operation's namespace.
    /// Without a key, the cache tier is skipped entirely.
    pub cache_key: Option<String>,
    /// TTL override for storing this call's result.
    pub cache_ttl: Option<Duration>,
    /// Bypass the cache for both reads and writes.
    pub skip_cache: bool,
}

impl ExecuteOptions {
    pub fn cached(key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(key.into()),
            ..Default::default()
        }
    }
}

/// Which tier produced the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Primary,
    Cache,
    Fallback,
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseSource::Primary => write!(f, "primary"),
            ResponseSource::Cache => write!(f, "cache"),
            ResponseSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// Successful pipeline outcome, annotated with how it was obtained.
/// Callers branch on `degraded`/`source` rather than on exceptions for
/// degraded-but-successful outcomes.
#[derive(Debug, Clone)]
pub struct DegradedResponse<T> {
    pub data: T,
    pub degraded: bool,
    pub source: ResponseSource,
    pub degradation_level: Option<ServiceHealthStatus>,
}

/// The degradation controller. Owns component health records and fallback
/// registrations; shares the cache and breaker registry with the rest of
/// the process by `Arc`.
///
/// Construct one per process inside a tokio runtime (a periodic
/// health-report task is spawned); tests construct their own instances
/// and call [`DegradationController::dispose`] for isolation.
pub struct DegradationController {
    config: DegradationConfig,
    breaker_config: CircuitBreakerConfig,
    cache: Arc<ResponseCache>,
    registry: Arc<CircuitBreakerRegistry>,
    metrics: Arc<dyn MetricsSink>,
    health: Arc<DashMap<String, ComponentHealth>>,
    fallbacks: Arc<DashMap<String, FallbackConfig>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DegradationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationController")
            .field("components", &self.health.len())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl DegradationController {
    /// Create a controller and start its periodic health-report loop.
    ///
    /// The controller enumerates the registry's existing breakers AND
    /// subscribes for future creations, so every named operation gains a
    /// health record no matter when its breaker appears.
    pub fn new(
        config: DegradationConfig,
        breaker_config: CircuitBreakerConfig,
        cache: Arc<ResponseCache>,
        registry: Arc<CircuitBreakerRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        breaker_config.validate()?;

        let health: Arc<DashMap<String, ComponentHealth>> = Arc::new(DashMap::new());

        // Enumerate-then-subscribe: both are required to avoid missing
        // breakers created before or after this point.
        for breaker in registry.get_all() {
            health
                .entry(breaker.name().to_string())
                .or_insert_with(|| ComponentHealth::new(breaker.name()));
        }
        let tracked = health.clone();
        registry.on_created(Arc::new(move |breaker| {
            tracked
                .entry(breaker.name().to_string())
                .or_insert_with(|| ComponentHealth::new(breaker.name()));
        }));

        let controller = Self {
            health_task: Mutex::new(None),
            config,
            breaker_config,
            cache,
            registry,
            metrics,
            health,
            fallbacks: Arc::new(DashMap::new()),
        };
        controller.spawn_health_loop();
        Ok(controller)
    }

    fn spawn_health_loop(&self) {
        let health = self.health.clone();
        let metrics = self.metrics.clone();
        let interval = self.config.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the loop
            // reports on a steady cadence after construction.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                metrics.increment_counter("degradation_health_checks_total", &[]);
                for entry in health.iter() {
                    let component = entry.value();
                    metrics.record_gauge(
                        "component_health_status",
                        component.status.as_gauge(),
                        &[("component", &component.name)],
                    );
                    if component.status != ServiceHealthStatus::Healthy {
                        warn!(
                            component = %component.name,
                            status = %component.status,
                            consecutive_failures = component.consecutive_failures,
                            "component degraded"
                        );
                    }
                }
            }
        });
        *self.health_task.lock() = Some(handle);
    }

    /// Register (or replace) the fallback configuration for an operation.
    pub fn register_fallback(&self, operation: &str, config: FallbackConfig) {
        debug!(
            operation = %operation,
            critical = config.critical,
            has_fallback = config.fallback.is_some(),
            "fallback registered"
        );
        self.fallbacks.insert(operation.to_string(), config);
    }

    /// Execute `operation` through the full degradation pipeline.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        operation: &str,
        executor: F,
        options: ExecuteOptions,
    ) -> Result<DegradedResponse<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        let breaker = self
            .registry
            .create(operation, self.breaker_config.thresholds_for(operation))?;
        self.health
            .entry(operation.to_string())
            .or_insert_with(|| ComponentHealth::new(operation));

        let started = Instant::now();

        // Fast path: the breaker is already open, so the primary would
        // fail fast anyway. Serve a cached value if one is still valid.
        if breaker.state() == CircuitState::Open {
            if let Some(response) = self.try_cache_tier::<T>(operation, &options) {
                self.record_outcome_duration(operation, ResponseSource::Cache, started);
                return Ok(response);
            }
        }

        // Primary tier with sequential retries and multiplicative backoff.
        let mut last_error: Option<ResilienceError> = None;
        for attempt in 0..=self.config.max_retry_attempts {
            if attempt > 0 {
                self.metrics
                    .increment_counter("retry_attempts_total", &[("operation", operation)]);
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }

            match breaker.call(|| executor()).await {
                Ok(data) => {
                    self.record_success(operation);
                    self.store_result(operation, &data, &options);
                    self.record_outcome_duration(operation, ResponseSource::Primary, started);
                    return Ok(DegradedResponse {
                        data,
                        degraded: false,
                        source: ResponseSource::Primary,
                        degradation_level: None,
                    });
                }
                Err(err) => {
                    debug!(
                        operation = %operation,
                        attempt,
                        error = %err,
                        "primary attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        // Exhaustion counts as one failure against the component, no
        // matter how many retries it took.
        let level = self.record_failure(operation);

        if let Some(response) = self.try_cache_tier::<T>(operation, &options) {
            self.record_outcome_duration(operation, ResponseSource::Cache, started);
            return Ok(response);
        }

        if let Some(response) = self.try_fallback_tier::<T>(operation, level).await {
            self.record_outcome_duration(operation, ResponseSource::Fallback, started);
            return Ok(response);
        }

        let critical = self.is_critical(operation);
        let source: BoxError = Box::new(last_error.unwrap_or_else(|| {
            ResilienceError::upstream(operation, "no attempt was made".into())
        }));
        if critical {
            error!(operation = %operation, "all degradation tiers exhausted for critical operation");
        } else {
            warn!(operation = %operation, "all degradation tiers exhausted");
        }
        Err(ResilienceError::ServiceDegraded {
            operation: operation.to_string(),
            source,
        })
    }

    /// Snapshot of every component's health record.
    pub fn component_health(&self) -> Vec<ComponentHealth> {
        self.health.iter().map(|e| e.value().clone()).collect()
    }

    /// Worst status across all components, weighted by criticality: a
    /// non-critical component never drives the overall status past
    /// SeverelyDegraded, while an unavailable critical component forces
    /// overall Unavailable.
    pub fn overall_health(&self) -> ServiceHealthStatus {
        let mut overall = ServiceHealthStatus::Healthy;
        for entry in self.health.iter() {
            let component = entry.value();
            let effective = if component.status == ServiceHealthStatus::Unavailable
                && !self.is_critical(&component.name)
            {
                ServiceHealthStatus::SeverelyDegraded
            } else {
                component.status
            };
            overall = overall.max(effective);
        }
        overall
    }

    /// Stop the periodic health loop. Idempotent; required for clean
    /// shutdown and test isolation.
    pub fn dispose(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
            debug!("degradation controller disposed");
        }
    }

    fn is_critical(&self, operation: &str) -> bool {
        self.fallbacks
            .get(operation)
            .map(|f| f.critical)
            .unwrap_or(false)
    }

    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let factor = self
            .config
            .retry_backoff_factor
            .powi(failed_attempt as i32);
        let delay = self.config.initial_retry_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.config.max_retry_delay.as_secs_f64()))
    }

    fn try_cache_tier<T: DeserializeOwned>(
        &self,
        operation: &str,
        options: &ExecuteOptions,
    ) -> Option<DegradedResponse<T>> {
        if options.skip_cache {
            return None;
        }
        let key = options.cache_key.as_deref()?;
        let hit = self.cache.get(operation, key)?;
        match serde_json::from_value::<T>(hit.value) {
            Ok(data) => {
                self.metrics
                    .increment_counter("cache_hits_total", &[("operation", operation)]);
                let level = self.current_level(operation);
                Some(DegradedResponse {
                    data,
                    degraded: true,
                    source: ResponseSource::Cache,
                    degradation_level: Some(level),
                })
            }
            Err(err) => {
                // A stale shape in the cache is treated as a miss.
                warn!(operation = %operation, error = %err, "cached payload failed conversion");
                None
            }
        }
    }

    async fn try_fallback_tier<T: DeserializeOwned>(
        &self,
        operation: &str,
        level: ServiceHealthStatus,
    ) -> Option<DegradedResponse<T>> {
        let fallback = self.fallbacks.get(operation)?.fallback.clone()?;
        self.metrics
            .increment_counter("fallback_activations_total", &[("operation", operation)]);
        info!(operation = %operation, "invoking registered fallback");

        match fallback().await {
            Ok(value) => match serde_json::from_value::<T>(value) {
                Ok(data) => {
                    self.metrics
                        .increment_counter("fallback_success_total", &[("operation", operation)]);
                    Some(DegradedResponse {
                        data,
                        degraded: true,
                        source: ResponseSource::Fallback,
                        degradation_level: Some(level),
                    })
                }
                Err(err) => {
                    self.metrics
                        .increment_counter("fallback_failures_total", &[("operation", operation)]);
                    warn!(operation = %operation, error = %err, "fallback payload failed conversion");
                    None
                }
            },
            Err(err) => {
                self.metrics
                    .increment_counter("fallback_failures_total", &[("operation", operation)]);
                warn!(operation = %operation, error = %err, "fallback failed");
                None
            }
        }
    }

    fn store_result<T: Serialize>(&self, operation: &str, data: &T, options: &ExecuteOptions) {
        if options.skip_cache {
            return;
        }
        let Some(key) = options.cache_key.as_deref() else {
            return;
        };
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(err) => {
                warn!(operation = %operation, error = %err, "result not cacheable");
                return;
            }
        };
        let ttl = options
            .cache_ttl
            .or_else(|| self.fallbacks.get(operation).and_then(|f| f.cache_ttl));
        self.cache.set(operation, key, value, ttl);
    }

    fn record_success(&self, operation: &str) {
        let mut entry = self
            .health
            .entry(operation.to_string())
            .or_insert_with(|| ComponentHealth::new(operation));
        entry.consecutive_failures = 0;
        entry.consecutive_successes += 1;

        if entry.status != ServiceHealthStatus::Healthy
            && entry.consecutive_successes >= self.config.component_recovery_threshold
        {
            let previous = entry.status;
            entry.status = ServiceHealthStatus::Healthy;
            entry.last_change_at = Utc::now();
            info!(component = %operation, from = %previous, "component recovered");
            self.metrics.record_gauge(
                "component_health_status",
                ServiceHealthStatus::Healthy.as_gauge(),
                &[("component", operation)],
            );
        }
    }

    /// Record an exhausted execution and return the component's (possibly
    /// escalated) degradation level.
    fn record_failure(&self, operation: &str) -> ServiceHealthStatus {
        let mut entry = self
            .health
            .entry(operation.to_string())
            .or_insert_with(|| ComponentHealth::new(operation));
        entry.consecutive_successes = 0;
        entry.consecutive_failures += 1;

        let threshold = self.config.component_failure_threshold;
        let computed = if entry.consecutive_failures >= threshold * 3 {
            ServiceHealthStatus::Unavailable
        } else if entry.consecutive_failures >= threshold * 2 {
            ServiceHealthStatus::SeverelyDegraded
        } else if entry.consecutive_failures >= threshold {
            ServiceHealthStatus::PartiallyDegraded
        } else {
            entry.status
        };

        // Escalation is monotonic; recovery happens only through
        // record_success once the recovery threshold is met.
        let escalated = computed.max(entry.status);
        if escalated != entry.status {
            warn!(
                component = %operation,
                from = %entry.status,
                to = %escalated,
                consecutive_failures = entry.consecutive_failures,
                "component degradation escalated"
            );
            entry.status = escalated;
            entry.last_change_at = Utc::now();
            self.metrics.record_gauge(
                "component_health_status",
                escalated.as_gauge(),
                &[("component", operation)],
            );
        }
        entry.status
    }

    fn current_level(&self, operation: &str) -> ServiceHealthStatus {
        self.health
            .get(operation)
            .map(|h| h.status)
            .unwrap_or(ServiceHealthStatus::Healthy)
    }

    fn record_outcome_duration(&self, operation: &str, source: ResponseSource, started: Instant) {
        self.metrics.record_duration(
            "operation_duration",
            started.elapsed(),
            &[("operation", operation), ("source", source_label(source))],
        );
    }
}

fn source_label(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Primary => "primary",
        ResponseSource::Cache => "cache",
        ResponseSource::Fallback => "fallback",
    }
}

impl Drop for DegradationController {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerThresholds, CacheConfig};
    use crate::resilience::metrics::InMemoryMetrics;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> DegradationConfig {
        DegradationConfig {
            max_retry_attempts: 2,
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(4),
            retry_backoff_factor: 2.0,
            component_failure_threshold: 2,
            component_recovery_threshold: 2,
            health_check_interval: Duration::from_secs(3600),
        }
    }

    fn lenient_breakers() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            default_thresholds: BreakerThresholds {
                failure_threshold: 100,
                reset_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
            operation_thresholds: Default::default(),
        }
    }

    struct Fixture {
        controller: DegradationController,
        cache: Arc<ResponseCache>,
        registry: Arc<CircuitBreakerRegistry>,
        metrics: Arc<InMemoryMetrics>,
    }

    fn fixture_with(config: DegradationConfig) -> Fixture {
        let cache = Arc::new(
            ResponseCache::new(CacheConfig {
                default_ttl: Duration::from_secs(60),
                max_items: 100,
            })
            .unwrap(),
        );
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let metrics = InMemoryMetrics::new();
        let controller = DegradationController::new(
            config,
            lenient_breakers(),
            cache.clone(),
            registry.clone(),
            metrics.clone(),
        )
        .unwrap();
        Fixture {
            controller,
            cache,
            registry,
            metrics,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(fast_config())
    }

    fn failing() -> std::result::Result<Value, BoxError> {
        Err("upstream 503".into())
    }

    #[tokio::test]
    async fn primary_success_is_not_degraded() {
        let fx = fixture();
        let response: DegradedResponse<Value> = fx
            .controller
            .execute_with_fallback(
                "listRooms",
                || async { Ok(json!({"rooms": []})) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert!(!response.degraded);
        assert_eq!(response.source, ResponseSource::Primary);
        assert_eq!(response.degradation_level, None);
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn primary_success_populates_cache() {
        let fx = fixture();
        let _: DegradedResponse<Value> = fx
            .controller
            .execute_with_fallback(
                "listRooms",
                || async { Ok(json!([1, 2, 3])) },
                ExecuteOptions::cached("page-1"),
            )
            .await
            .unwrap();

        let hit = fx.cache.get("listRooms", "page-1").expect("cached");
        assert_eq!(hit.value, json!([1, 2, 3]));
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn skip_cache_bypasses_read_and_write() {
        let fx = fixture();
        fx.cache.set("listRooms", "k", json!("stale"), None);

        let options = ExecuteOptions {
            cache_key: Some("k".into()),
            cache_ttl: None,
            skip_cache: true,
        };
        let response: DegradedResponse<Value> = fx
            .controller
            .execute_with_fallback("listRooms", || async { Ok(json!("fresh")) }, options)
            .await
            .unwrap();

        assert_eq!(response.data, json!("fresh"));
        // Write was also skipped: the stale entry is untouched.
        assert_eq!(fx.cache.get("listRooms", "k").unwrap().value, json!("stale"));
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn fallback_tier_engages_and_never_throws() {
        let fx = fixture();
        fx.controller.register_fallback(
            "listRooms",
            FallbackConfig::with_fallback(|| async { Ok(json!({"rooms": [], "cached": true})) }),
        );

        let response: DegradedResponse<Value> = fx
            .controller
            .execute_with_fallback("listRooms", || async { failing() }, ExecuteOptions::default())
            .await
            .unwrap();

        assert!(response.degraded);
        assert_eq!(response.source, ResponseSource::Fallback);
        assert_eq!(response.data, json!({"rooms": [], "cached": true}));
        assert_eq!(
            fx.metrics
                .counter("fallback_activations_total", &[("operation", "listRooms")]),
            1
        );
        assert_eq!(
            fx.metrics
                .counter("fallback_success_total", &[("operation", "listRooms")]),
            1
        );
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn exhaustion_without_tiers_raises_after_exact_attempts() {
        let fx = fixture();
        let invocations = Arc::new(AtomicU32::new(0));

        let counter = invocations.clone();
        let result: Result<DegradedResponse<Value>> = fx
            .controller
            .execute_with_fallback(
                "listRooms",
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        failing()
                    }
                },
                ExecuteOptions::default(),
            )
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::ServiceDegraded { .. })
        ));
        // Initial attempt plus max_retry_attempts retries.
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(
            fx.metrics
                .counter("retry_attempts_total", &[("operation", "listRooms")]),
            2
        );
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn cache_tier_serves_before_fallback() {
        let fx = fixture();
        fx.cache.set("listRooms", "page-1", json!(["cached"]), None);
        fx.controller.register_fallback(
            "listRooms",
            FallbackConfig::with_fallback(|| async { Ok(json!(["fallback"])) }),
        );

        let response: DegradedResponse<Value> = fx
            .controller
            .execute_with_fallback(
                "listRooms",
                || async { failing() },
                ExecuteOptions::cached("page-1"),
            )
            .await
            .unwrap();

        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(response.data, json!(["cached"]));
        assert_eq!(
            fx.metrics
                .counter("cache_hits_total", &[("operation", "listRooms")]),
            1
        );
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn open_breaker_fast_path_skips_executor() {
        let fx = fixture();
        let breaker = fx
            .registry
            .create("listRooms", BreakerThresholds::default())
            .unwrap();
        breaker.trip(None);
        fx.cache.set("listRooms", "page-1", json!(["cached"]), None);

        let invocations = Arc::new(AtomicU32::new(0));
        let counter = invocations.clone();
        let response: DegradedResponse<Value> = fx
            .controller
            .execute_with_fallback(
                "listRooms",
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(["live"]))
                    }
                },
                ExecuteOptions::cached("page-1"),
            )
            .await
            .unwrap();

        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn fallback_failure_on_critical_operation_degrades_hard() {
        let fx = fixture();
        fx.controller.register_fallback(
            "createRoom",
            FallbackConfig::with_fallback(|| async { Err::<Value, BoxError>("fallback down".into()) })
                .critical(true),
        );

        let result: Result<DegradedResponse<Value>> = fx
            .controller
            .execute_with_fallback("createRoom", || async { failing() }, ExecuteOptions::default())
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::ServiceDegraded { .. })
        ));
        assert_eq!(
            fx.metrics
                .counter("fallback_failures_total", &[("operation", "createRoom")]),
            1
        );
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn non_critical_exhaustion_also_raises() {
        // Documented policy: a typed API cannot fabricate a neutral
        // value, so non-critical operations raise on exhaustion too.
        let fx = fixture();
        fx.controller
            .register_fallback("listRooms", FallbackConfig::policy_only().critical(false));

        let result: Result<DegradedResponse<Value>> = fx
            .controller
            .execute_with_fallback("listRooms", || async { failing() }, ExecuteOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(ResilienceError::ServiceDegraded { .. })
        ));
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn health_escalates_and_recovers_with_hysteresis() {
        let fx = fixture();
        let run_failure = || async {
            let _: Result<DegradedResponse<Value>> = fx
                .controller
                .execute_with_fallback(
                    "listRooms",
                    || async { failing() },
                    ExecuteOptions::default(),
                )
                .await;
        };

        // component_failure_threshold = 2.
        run_failure().await;
        assert_eq!(
            fx.controller.overall_health(),
            ServiceHealthStatus::Healthy
        );
        run_failure().await;
        let health = fx.controller.component_health();
        let component = health.iter().find(|h| h.name == "listRooms").unwrap();
        assert_eq!(component.status, ServiceHealthStatus::PartiallyDegraded);
        assert_eq!(component.consecutive_failures, 2);

        run_failure().await;
        run_failure().await;
        assert_eq!(
            fx.controller.current_level("listRooms"),
            ServiceHealthStatus::SeverelyDegraded
        );
        run_failure().await;
        run_failure().await;
        assert_eq!(
            fx.controller.current_level("listRooms"),
            ServiceHealthStatus::Unavailable
        );

        // One success is not enough (recovery threshold = 2).
        let ok = || async {
            let _: DegradedResponse<Value> = fx
                .controller
                .execute_with_fallback(
                    "listRooms",
                    || async { Ok(json!(1)) },
                    ExecuteOptions::default(),
                )
                .await
                .unwrap();
        };
        ok().await;
        assert_eq!(
            fx.controller.current_level("listRooms"),
            ServiceHealthStatus::Unavailable
        );
        ok().await;
        assert_eq!(
            fx.controller.current_level("listRooms"),
            ServiceHealthStatus::Healthy
        );
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn overall_health_weights_criticality() {
        let fx = fixture();
        fx.controller
            .register_fallback("analytics", FallbackConfig::policy_only().critical(false));

        // Drive "analytics" to Unavailable (threshold 2 → 6 failures).
        for _ in 0..6 {
            let _: Result<DegradedResponse<Value>> = fx
                .controller
                .execute_with_fallback(
                    "analytics",
                    || async { failing() },
                    ExecuteOptions::default(),
                )
                .await;
        }
        assert_eq!(
            fx.controller.current_level("analytics"),
            ServiceHealthStatus::Unavailable
        );
        // Non-critical component caps the roll-up.
        assert_eq!(
            fx.controller.overall_health(),
            ServiceHealthStatus::SeverelyDegraded
        );

        // Marking it critical forces overall Unavailable.
        fx.controller
            .register_fallback("analytics", FallbackConfig::policy_only().critical(true));
        assert_eq!(
            fx.controller.overall_health(),
            ServiceHealthStatus::Unavailable
        );
        fx.controller.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_are_multiplicative_and_capped() {
        let config = DegradationConfig {
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(350),
            retry_backoff_factor: 2.0,
            component_failure_threshold: 10,
            component_recovery_threshold: 2,
            health_check_interval: Duration::from_secs(3600),
        };
        let fx = fixture_with(config);

        let timestamps: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let stamps = timestamps.clone();
        let result: Result<DegradedResponse<Value>> = fx
            .controller
            .execute_with_fallback(
                "listRooms",
                move || {
                    let stamps = stamps.clone();
                    async move {
                        stamps.lock().push(tokio::time::Instant::now());
                        failing()
                    }
                },
                ExecuteOptions::default(),
            )
            .await;
        assert!(result.is_err());

        let stamps = timestamps.lock();
        assert_eq!(stamps.len(), 4);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        // 100ms, 200ms, then 400ms capped at 350ms.
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
            ]
        );
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn typed_results_round_trip_through_cache() {
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Room {
            id: String,
            participants: u32,
        }

        let fx = fixture();
        let room = Room {
            id: "main".into(),
            participants: 4,
        };

        let stored = room.clone();
        let first: DegradedResponse<Room> = fx
            .controller
            .execute_with_fallback(
                "getRoom",
                move || {
                    let stored = stored.clone();
                    async move { Ok(stored) }
                },
                ExecuteOptions::cached("main"),
            )
            .await
            .unwrap();
        assert_eq!(first.data, room);

        // Primary now fails; the typed value comes back from cache.
        let second: DegradedResponse<Room> = fx
            .controller
            .execute_with_fallback(
                "getRoom",
                || async { Err::<Room, BoxError>("down".into()) },
                ExecuteOptions::cached("main"),
            )
            .await
            .unwrap();
        assert_eq!(second.data, room);
        assert_eq!(second.source, ResponseSource::Cache);
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn registry_created_breakers_gain_health_records() {
        let fx = fixture();
        fx.registry
            .create("webhooks", BreakerThresholds::default())
            .unwrap();
        assert!(fx
            .controller
            .component_health()
            .iter()
            .any(|h| h.name == "webhooks"));
        fx.controller.dispose();
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let fx = fixture();
        fx.controller.dispose();
        fx.controller.dispose();
    }
}
