//! # RoomBridge Core
//!
//! Resilience core for a conferencing-API protocol bridge: every upstream
//! REST call the bridge makes flows through the components in this crate
//! so transient upstream trouble degrades responses instead of failing
//! them outright.
//!
//! ## Components
//!
//! - **[`cache`]**: namespaced TTL response cache with bounded FIFO
//!   eviction
//! - **[`resilience`]**: circuit breakers, the breaker registry, and the
//!   graceful degradation controller (retry → cache → fallback tiers)
//! - **[`optimizer`]**: request coalescing, incremental paged loading,
//!   payload compaction, and a process-memory guard
//! - **[`config`]**: serde-backed configuration for all of the above
//! - **[`logging`]**: environment-aware tracing setup for hosts that
//!   want the crate's defaults
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use roombridge_core::cache::ResponseCache;
//! use roombridge_core::config::ResilienceConfig;
//! use roombridge_core::resilience::{CircuitBreakerRegistry, DegradationController, NoopMetrics};
//! use std::sync::Arc;
//!
//! # fn main() -> roombridge_core::Result<()> {
//! let config = ResilienceConfig::default();
//! let cache = Arc::new(ResponseCache::new(config.cache.clone())?);
//! let registry = Arc::new(CircuitBreakerRegistry::new());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod optimizer;
pub mod resilience;

pub use cache::ResponseCache;
pub use config::ResilienceConfig;
pub use error::{BoxError, ResilienceError, Result};
pub use optimizer::ResourceOptimizer;
pub use resilience::{CircuitBreakerRegistry, DegradationController};
