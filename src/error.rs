//! Structured error handling for the resilience core.
//!
//! The taxonomy mirrors the tiers of the request-execution pipeline:
//! a breaker that refuses a call, an upstream executor that failed, and
//! the terminal case where every tier (primary, retries, cache, fallback)
//! has been exhausted. Cache misses are plain `Option::None` and never
//! surface as errors.

use std::time::Duration;

/// Opaque upstream failure carried as an error cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the resilience core.
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    /// The named circuit breaker is open and the reset timeout has not
    /// elapsed; the wrapped executor was not invoked.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// The upstream executor failed. The original error is preserved as
    /// the source so callers three layers up can still inspect it.
    #[error("upstream operation '{operation}' failed")]
    Upstream {
        operation: String,
        #[source]
        source: BoxError,
    },

    /// Every tier is exhausted: the primary failed after all retries, no
    /// valid cache entry existed, and no fallback produced data. Carries
    /// the last underlying error.
    #[error("service degraded: all tiers exhausted for operation '{operation}'")]
    ServiceDegraded {
        operation: String,
        #[source]
        source: BoxError,
    },

    /// A batch executor resolved without producing a result for one of the
    /// keys it was handed.
    #[error("batch '{batch_id}' resolved without a result for key '{key}'")]
    BatchKeyMissing { batch_id: String, key: String },

    /// A cached or fallback payload could not be converted into the
    /// caller's requested type.
    #[error("payload for operation '{operation}' failed deserialization")]
    PayloadConversion {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    /// Malformed construction-time configuration. Treated as a programming
    /// error: fail fast, never swallow.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl ResilienceError {
    /// Wrap an executor failure for the given operation.
    pub fn upstream(operation: impl Into<String>, source: BoxError) -> Self {
        Self::Upstream {
            operation: operation.into(),
            source,
        }
    }

    /// True when the error indicates transient unavailability that a
    /// caller may reasonably retry later (after the breaker cooldown).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. } | ResilienceError::Upstream { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Validate that a duration is non-zero, for construction-time checks.
pub(crate) fn require_nonzero_duration(value: Duration, field: &str) -> Result<()> {
    if value.is_zero() {
        return Err(ResilienceError::Configuration(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_preserves_cause() {
        let cause: BoxError = "connection reset".into();
        let err = ResilienceError::upstream("listRooms", cause);
        assert!(err.to_string().contains("listRooms"));
        let source = std::error::Error::source(&err).expect("cause preserved");
        assert_eq!(source.to_string(), "connection reset");
    }

    #[test]
    fn transient_classification() {
        assert!(ResilienceError::CircuitOpen { name: "api".into() }.is_transient());
        assert!(!ResilienceError::Configuration("bad".into()).is_transient());
    }

    #[test]
    fn nonzero_duration_guard() {
        assert!(require_nonzero_duration(Duration::from_millis(1), "ttl").is_ok());
        let err = require_nonzero_duration(Duration::ZERO, "ttl").unwrap_err();
        assert!(matches!(err, ResilienceError::Configuration(_)));
    }
}
