//! # Resource Optimizer
//!
//! Request batching, incremental loading, payload compaction, and a
//! memory-pressure guard for callers with heavy access patterns. The
//! optimizer owns its own bounded [`ResponseCache`] (namespace = batch
//! id) and is independent of the degradation controller.
//!
//! Consumers observe the optimizer through a broadcast event stream:
//! load progress, load completion, and memory-pressure evictions.

pub mod batch;
pub mod compress;
pub mod incremental;

pub use batch::{BatchExecutor, BatchFn};
pub use compress::compress_response;
pub use incremental::{IncrementalLoadOptions, PageFn, PageLoader, PageResult};

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheStats, ResponseCache};
use crate::config::OptimizerConfig;
use crate::error::Result;

use batch::Batcher;

/// Notifications emitted by the optimizer.
#[derive(Debug, Clone)]
pub enum OptimizerEvent {
    /// A page finished loading during an incremental load.
    LoadProgress {
        page: u32,
        loaded: u64,
        total: u64,
        percentage: f64,
    },
    /// An incremental load finished.
    LoadComplete { pages: u32, loaded: u64 },
    /// The process exceeded its memory ceiling; the optimizer cache was
    /// cleared in response.
    MemoryExceeded { used_bytes: u64, limit_bytes: u64 },
}

/// Source of process-memory readings for the guard. Tests inject a
/// deterministic probe; production uses [`SystemMemoryProbe`].
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> u64;
}

/// Probe backed by sysinfo's per-process resident memory reading.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Point-in-time optimizer statistics.
#[derive(Debug, Clone)]
pub struct OptimizerStats {
    pub cache: CacheStats,
    pub pending_batches: usize,
    pub batch_executions: u64,
    pub coalesced_requests: u64,
    pub memory_evictions: u64,
}

/// Batching, paging, and memory-bounded caching utility.
pub struct ResourceOptimizer {
    config: OptimizerConfig,
    cache: Arc<ResponseCache>,
    batcher: Arc<Batcher>,
    events: broadcast::Sender<OptimizerEvent>,
    memory_evictions: Arc<AtomicU64>,
    guard_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceOptimizer")
            .field("config", &self.config)
            .finish()
    }
}

impl ResourceOptimizer {
    /// Create an optimizer with the given probe and start the periodic
    /// memory guard. Must be called inside a tokio runtime.
    pub fn new(config: OptimizerConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ResponseCache::new(config.cache.clone())?);
        let batcher = Arc::new(Batcher::new(config.batch_window, cache.clone()));
        let (events, _) = broadcast::channel(256);

        let optimizer = Self {
            batcher,
            events,
            memory_evictions: Arc::new(AtomicU64::new(0)),
            guard_task: Mutex::new(None),
            cache,
            config,
        };
        optimizer.spawn_memory_guard(probe);
        Ok(optimizer)
    }

    /// Create an optimizer probing real process memory via sysinfo.
    pub fn with_system_probe(config: OptimizerConfig) -> Result<Self> {
        Self::new(config, Arc::new(SystemMemoryProbe::new()))
    }

    fn spawn_memory_guard(&self, probe: Arc<dyn MemoryProbe>) {
        let cache = self.cache.clone();
        let events = self.events.clone();
        let limit = self.config.max_memory_bytes;
        let interval = self.config.memory_check_interval;
        let evictions = self.memory_evictions.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let used = probe.used_bytes();
                if used > limit {
                    warn!(
                        used_bytes = used,
                        limit_bytes = limit,
                        "memory ceiling exceeded, clearing optimizer cache"
                    );
                    cache.clear();
                    evictions.fetch_add(1, Ordering::Relaxed);
                    // No subscribers is fine; the event is best-effort.
                    let _ = events.send(OptimizerEvent::MemoryExceeded {
                        used_bytes: used,
                        limit_bytes: limit,
                    });
                } else {
                    debug!(used_bytes = used, limit_bytes = limit, "memory check passed");
                }
            }
        });
        *self.guard_task.lock() = Some(handle);
    }

    /// Coalesce a key lookup into the current batch for `batch_id`; see
    /// [`batch::BatchExecutor`]. Cached results short-circuit without a
    /// new batch.
    pub async fn batch_request(
        &self,
        batch_id: &str,
        key: &str,
        executor: Arc<dyn BatchExecutor>,
    ) -> Result<Value> {
        self.batcher.request(batch_id, key, executor).await
    }

    /// Subscribe to optimizer notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<OptimizerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            cache: self.cache.stats(),
            pending_batches: self.batcher.pending_batches(),
            batch_executions: self.batcher.executions(),
            coalesced_requests: self.batcher.coalesced(),
            memory_evictions: self.memory_evictions.load(Ordering::Relaxed),
        }
    }

    /// Stop the memory guard. Idempotent.
    pub fn destroy(&self) {
        if let Some(handle) = self.guard_task.lock().take() {
            handle.abort();
            debug!("resource optimizer destroyed");
        }
    }

    pub(crate) fn emit(&self, event: OptimizerEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for ResourceOptimizer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
pub(crate) fn test_probe(used_bytes: u64) -> Arc<dyn MemoryProbe> {
    struct FixedProbe(u64);
    impl MemoryProbe for FixedProbe {
        fn used_bytes(&self) -> u64 {
            self.0
        }
    }
    Arc::new(FixedProbe(used_bytes))
}
