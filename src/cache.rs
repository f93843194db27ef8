//! # Response Cache
//!
//! Bounded, namespaced, TTL-based key/value store for upstream API
//! payloads. Expiry is lazy: an expired entry is treated as absent on
//! `get` and removed at that point, so no background sweeper is needed.
//! Capacity eviction is insertion-order (oldest entry first), not LRU;
//! callers rely on the predictability of FIFO eviction.
//!
//! Namespaces are a logical partition only: internally each entry is
//! stored under a compound key, and `invalidate_namespace` removes exactly
//! the entries whose namespace matches.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::Result;

/// Separator between namespace and key in the internal compound key.
/// A unit-separator control character cannot appear in API namespaces.
const NS_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
    etag: Option<String>,
}

/// A value read from the cache together with its remaining validity.
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub value: Value,
    pub expires_at: Instant,
    pub etag: Option<String>,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_items: usize,
    pub valid_items: usize,
    pub expired_items: usize,
    pub max_items: usize,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Compound keys in insertion order, driving FIFO eviction.
    insertion_order: VecDeque<String>,
}

/// Bounded TTL cache shared by the degradation controller and the
/// resource optimizer.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    /// Create a cache with the given sizing. Fails fast on a zero
    /// capacity or zero default TTL.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        })
    }

    fn compound_key(namespace: &str, key: &str) -> String {
        format!("{namespace}{NS_SEPARATOR}{key}")
    }

    /// Store a value under `namespace`/`key`, evicting the oldest entry if
    /// the cache is at capacity and this is a new key.
    pub fn set(&self, namespace: &str, key: &str, value: Value, ttl_override: Option<Duration>) {
        self.set_with_etag(namespace, key, value, ttl_override, None);
    }

    /// `set` variant carrying an upstream ETag for conditional refresh.
    pub fn set_with_etag(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl_override: Option<Duration>,
        etag: Option<String>,
    ) {
        let ttl = ttl_override.unwrap_or(self.config.default_ttl);
        let compound = Self::compound_key(namespace, key);
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
            etag,
        };

        let mut inner = self.inner.lock();
        if inner.entries.insert(compound.clone(), entry).is_some() {
            // Overwrite keeps the original insertion position.
            return;
        }
        inner.insertion_order.push_back(compound);

        while inner.entries.len() > self.config.max_items {
            if let Some(oldest) = inner.insertion_order.pop_front() {
                if inner.entries.remove(&oldest).is_some() {
                    debug!(key = %oldest, "cache capacity eviction");
                }
            } else {
                break;
            }
        }
    }

    /// Fetch a value. Expired entries are treated as absent and removed.
    pub fn get(&self, namespace: &str, key: &str) -> Option<CachedValue> {
        let compound = Self::compound_key(namespace, key);
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(&compound) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(CachedValue {
                    value: entry.value.clone(),
                    expires_at: entry.expires_at,
                    etag: entry.etag.clone(),
                });
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(&compound);
            inner.insertion_order.retain(|k| k != &compound);
        }
        None
    }

    /// Remove a single entry, reporting whether it existed.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        let compound = Self::compound_key(namespace, key);
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(&compound).is_some();
        if removed {
            inner.insertion_order.retain(|k| k != &compound);
        }
        removed
    }

    /// Remove every entry in the namespace, returning the exact count.
    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        let prefix = format!("{namespace}{NS_SEPARATOR}");
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &doomed {
            inner.entries.remove(key);
        }
        inner.insertion_order.retain(|k| !k.starts_with(&prefix));
        debug!(namespace = %namespace, removed = doomed.len(), "namespace invalidated");
        doomed.len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.insertion_order.clear();
    }

    /// Snapshot of item counts. Expired-but-unswept entries are counted
    /// separately from valid ones.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let now = Instant::now();
        let valid = inner
            .entries
            .values()
            .filter(|e| e.expires_at > now)
            .count();
        CacheStats {
            total_items: inner.entries.len(),
            valid_items: valid,
            expired_items: inner.entries.len() - valid,
            max_items: self.config.max_items,
        }
    }
}
