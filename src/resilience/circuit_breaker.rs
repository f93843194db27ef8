//! # Circuit Breaker
//!
//! Per-operation failure-counting state machine that fails fast when an
//! upstream dependency is unhealthy. Three states:
//! Closed (normal operation), Open (failing fast), and HalfOpen (testing
//! recovery with trial calls).
//!
//! The breaker never retries on its own; the degradation controller's
//! retry loop decides whether a `CircuitOpen` outcome is worth retrying.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerThresholds;
use crate::error::{BoxError, ResilienceError, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing fast, calls rejected without invoking the executor.
    Open,
    /// Testing recovery, trial calls allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Callback invoked on every state transition: `(name, from, to)`.
pub type TransitionListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// When the circuit last opened, for the reset-timeout clock.
    opened_at: Option<Instant>,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    /// Cause supplied with the most recent administrative trip.
    trip_reason: Option<String>,
}

/// Per-operation circuit breaker. One instance per named operation,
/// created via the [`CircuitBreakerRegistry`](super::registry::CircuitBreakerRegistry)
/// and reused for the process lifetime.
pub struct CircuitBreaker {
    name: String,
    thresholds: BreakerThresholds,
    inner: Mutex<BreakerInner>,
    listeners: RwLock<Vec<TransitionListener>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("thresholds", &self.thresholds)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker. Fails fast on zero thresholds: malformed config
    /// is a programming error, not a runtime condition.
    pub fn new(name: impl Into<String>, thresholds: BreakerThresholds) -> Result<Self> {
        thresholds.validate()?;
        let name = name.into();
        debug!(
            breaker = %name,
            failure_threshold = thresholds.failure_threshold,
            reset_timeout_ms = thresholds.reset_timeout.as_millis() as u64,
            success_threshold = thresholds.success_threshold,
            "circuit breaker initialized"
        );
        Ok(Self {
            name,
            thresholds,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                opened_at: None,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                trip_reason: None,
            }),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_failure_at
    }

    /// Cause recorded by the most recent [`CircuitBreaker::trip`], if any.
    /// Cleared by [`CircuitBreaker::reset`].
    pub fn last_trip_reason(&self) -> Option<String> {
        self.inner.lock().trip_reason.clone()
    }

    /// Register a listener invoked synchronously on every state
    /// transition. Listeners must not block or panic.
    pub fn on_transition(&self, listener: TransitionListener) {
        self.listeners.write().push(listener);
    }

    /// Execute an operation under breaker protection.
    ///
    /// Rejects with [`ResilienceError::CircuitOpen`] while the circuit is
    /// open and the reset timeout has not elapsed; otherwise invokes the
    /// operation and records its outcome. An elapsed timeout admits the
    /// call as a half-open trial.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(source) => {
                self.record_failure();
                Err(ResilienceError::upstream(self.name.clone(), source))
            }
        }
    }

    /// Force the circuit closed and zero all counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.trip_reason = None;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        if let Some((from, to)) = transition {
            info!(breaker = %self.name, "circuit breaker reset");
            self.notify(from, to);
        }
    }

    /// Force the circuit open, for administrative or test use. The
    /// optional cause is recorded as failure context and logged.
    pub fn trip(&self, reason: Option<BoxError>) {
        let reason_text = reason.map(|e| e.to_string());
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.success_count = 0;
            if reason_text.is_some() {
                inner.last_failure_at = Some(Utc::now());
            }
            inner.trip_reason = reason_text.clone();
            (from != CircuitState::Open).then_some((from, CircuitState::Open))
        };
        if let Some((from, to)) = transition {
            warn!(
                breaker = %self.name,
                reason = reason_text.as_deref(),
                "circuit breaker tripped"
            );
            self.notify(from, to);
        }
    }

    /// Decide whether a call may proceed, transitioning Open -> HalfOpen
    /// when the reset timeout has elapsed.
    fn admit(&self) -> Result<()> {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => None,
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|t| t.elapsed() >= self.thresholds.reset_timeout)
                        // Open without a timestamp only happens through
                        // administrative trip races; admit the probe.
                        .unwrap_or(true);
                    if elapsed {
                        inner.state = CircuitState::HalfOpen;
                        inner.success_count = 0;
                        Some((CircuitState::Open, CircuitState::HalfOpen))
                    } else {
                        return Err(ResilienceError::CircuitOpen {
                            name: self.name.clone(),
                        });
                    }
                }
            }
        };
        if let Some((from, to)) = transition {
            info!(breaker = %self.name, "circuit breaker half-open, probing recovery");
            self.notify(from, to);
        }
        Ok(())
    }

    fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.thresholds.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.opened_at = None;
                        inner.success_count = 0;
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some((from, to)) = transition {
            info!(breaker = %self.name, "circuit breaker closed (recovered)");
            self.notify(from, to);
        }
    }

    fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failure_count += 1;
            inner.last_failure_at = Some(Utc::now());
            match inner.state {
                CircuitState::Closed
                    if inner.failure_count >= self.thresholds.failure_threshold =>
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    Some((CircuitState::Closed, CircuitState::Open))
                }
                // Any half-open failure reopens immediately and restarts
                // the reset-timeout clock.
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.success_count = 0;
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                _ => None,
            }
        };
        if let Some((from, to)) = transition {
            warn!(
                breaker = %self.name,
                failure_threshold = self.thresholds.failure_threshold,
                "circuit breaker opened (failing fast)"
            );
            self.notify(from, to);
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&self.name, from, to);
        }
    }
}
