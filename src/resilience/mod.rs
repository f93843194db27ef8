//! # Resilience Module
//!
//! Fault tolerance for the upstream conferencing API: circuit breakers
//! isolate failing operations, a name-keyed registry shares breaker
//! instances process-wide, and the graceful degradation controller layers
//! retry, cache, and fallback tiers on top so callers receive reduced
//! data instead of hard failures whenever any tier can still answer.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: fail fast when an operation's upstream is
//!   unhealthy, with half-open probing for recovery
//! - **Registry**: one breaker per named operation, with creation
//!   notifications for observers such as the health loop
//! - **Degradation Controller**: primary → retries → cache → fallback
//!   tier walk, component health tracking with hysteresis
//! - **Metrics**: every state transition reported through a sink trait
//!   the host application implements
//!
//! ## Usage
//!
//! ```rust,no_run
//! use roombridge_core::cache::ResponseCache;
//! use roombridge_core::config::ResilienceConfig;
//! use roombridge_core::resilience::{
//!     CircuitBreakerRegistry, DegradationController, ExecuteOptions, NoopMetrics,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResilienceConfig::default();
//! let cache = Arc::new(ResponseCache::new(config.cache.clone())?);
//! let registry = Arc::new(CircuitBreakerRegistry::new());
//! let controller = DegradationController::new(
//!     config.degradation.clone(),
//!     config.circuit_breaker.clone(),
//!     cache,
//!     registry,
//!     Arc::new(NoopMetrics),
//! )?;
//!
//! let response: roombridge_core::resilience::DegradedResponse<serde_json::Value> = controller
//!     .execute_with_fallback(
//!         "listRooms",
//!         || async { Ok(serde_json::json!({"rooms": []})) },
//!         ExecuteOptions::cached("page-1"),
//!     )
//!     .await?;
//!
//! if response.degraded {
//!     println!("served from {}", response.source);
//! }
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod degradation;
pub mod metrics;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitState, TransitionListener};
pub use degradation::{
    ComponentHealth, DegradationController, DegradedResponse, ExecuteOptions, FallbackConfig,
    FallbackFn, ResponseSource, ServiceHealthStatus,
};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use registry::{CircuitBreakerRegistry, CreatedListener};
