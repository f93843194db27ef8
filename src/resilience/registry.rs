//! # Circuit Breaker Registry
//!
//! Name-keyed store of circuit breakers, shared process-wide by injection
//! from the composition root. `create` is idempotent by name so every
//! caller asking for the same operation gets the same instance.
//!
//! Observers can subscribe to creation notifications. The registry does
//! NOT replay past creations to new subscribers: a late subscriber must
//! enumerate [`CircuitBreakerRegistry::get_all`] first and then subscribe,
//! or it will miss breakers created before it attached. The degradation
//! controller's health loop does exactly this at construction.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::config::BreakerThresholds;
use crate::error::Result;

use super::circuit_breaker::CircuitBreaker;

/// Callback invoked synchronously when a new breaker is registered.
pub type CreatedListener = Arc<dyn Fn(&Arc<CircuitBreaker>) + Send + Sync>;

/// Process-wide named-instance store for circuit breakers.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    created_listeners: RwLock<Vec<CreatedListener>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.len())
            .field("listeners", &self.created_listeners.read().len())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the breaker for `name`. Creation is idempotent: an
    /// existing breaker is returned untouched and no creation
    /// notification fires for the duplicate request.
    pub fn create(&self, name: &str, thresholds: BreakerThresholds) -> Result<Arc<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(existing.clone());
        }

        let breaker = Arc::new(CircuitBreaker::new(name, thresholds)?);
        // A concurrent create for the same name may have won the race;
        // keep whichever instance landed first.
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| breaker.clone());
        let stored = entry.clone();
        drop(entry);

        if Arc::ptr_eq(&stored, &breaker) {
            debug!(breaker = %name, "circuit breaker registered");
            let listeners = self.created_listeners.read().clone();
            for listener in listeners {
                listener(&stored);
            }
        }
        Ok(stored)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|b| b.clone()).collect()
    }

    pub fn remove(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Subscribe to future creations. Pair with [`Self::get_all`] to also
    /// observe breakers that already exist.
    pub fn on_created(&self, listener: CreatedListener) {
        self.created_listeners.write().push(listener);
    }
}
