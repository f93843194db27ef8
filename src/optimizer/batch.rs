//! Request coalescing: individual key lookups that share a batch id and
//! arrive within the coalescing window are merged into a single executor
//! invocation. Each caller resolves from the returned map entry for its
//! own key, and resolved entries are cached under the batch id's
//! namespace so identical later requests short-circuit entirely.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::error::{BoxError, ResilienceError, Result};

/// Upstream executor for one flushed batch: receives the union of keys,
/// returns a key → result mapping.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn fetch(
        &self,
        keys: Vec<String>,
    ) -> std::result::Result<HashMap<String, Value>, BoxError>;
}

/// Adapter so plain async closures can serve as batch executors.
pub struct BatchFn<F>(pub F);

#[async_trait]
impl<F, Fut> BatchExecutor for BatchFn<F>
where
    F: Fn(Vec<String>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<HashMap<String, Value>, BoxError>> + Send,
{
    async fn fetch(
        &self,
        keys: Vec<String>,
    ) -> std::result::Result<HashMap<String, Value>, BoxError> {
        (self.0)(keys).await
    }
}

type Waiter = (String, oneshot::Sender<Result<Value>>);

/// A batch being assembled during its coalescing window. Transient:
/// created when the first key arrives, destroyed once the executor
/// resolves and all waiters are notified.
struct PendingBatch {
    keys: Vec<String>,
    waiters: Vec<Waiter>,
}

/// Coalescing engine owned by the resource optimizer.
pub(super) struct Batcher {
    window: Duration,
    cache: Arc<ResponseCache>,
    pending: Mutex<HashMap<String, PendingBatch>>,
    executions: AtomicU64,
    coalesced: AtomicU64,
}

impl Batcher {
    pub(super) fn new(window: Duration, cache: Arc<ResponseCache>) -> Self {
        Self {
            window,
            cache,
            pending: Mutex::new(HashMap::new()),
            executions: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    pub(super) fn pending_batches(&self) -> usize {
        self.pending.lock().len()
    }

    pub(super) fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub(super) fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub(super) async fn request(
        self: &Arc<Self>,
        batch_id: &str,
        key: &str,
        executor: Arc<dyn BatchExecutor>,
    ) -> Result<Value> {
        if let Some(hit) = self.cache.get(batch_id, key) {
            return Ok(hit.value);
        }

        let (tx, rx) = oneshot::channel();
        let opens_batch = {
            let mut pending = self.pending.lock();
            match pending.get_mut(batch_id) {
                Some(batch) => {
                    if !batch.keys.iter().any(|k| k == key) {
                        batch.keys.push(key.to_string());
                    }
                    batch.waiters.push((key.to_string(), tx));
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    false
                }
                None => {
                    pending.insert(
                        batch_id.to_string(),
                        PendingBatch {
                            keys: vec![key.to_string()],
                            waiters: vec![(key.to_string(), tx)],
                        },
                    );
                    true
                }
            }
        };

        if opens_batch {
            // The batch opener schedules the flush; the executor supplied
            // with the first key serves the whole batch.
            let batcher = self.clone();
            let batch_id = batch_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(batcher.window).await;
                batcher.flush(&batch_id, executor).await;
            });
        }

        rx.await.unwrap_or_else(|_| {
            Err(ResilienceError::upstream(
                batch_id,
                "batch flush task dropped before resolving".into(),
            ))
        })
    }

    async fn flush(&self, batch_id: &str, executor: Arc<dyn BatchExecutor>) {
        let Some(batch) = self.pending.lock().remove(batch_id) else {
            return;
        };
        debug!(
            batch = %batch_id,
            keys = batch.keys.len(),
            waiters = batch.waiters.len(),
            "flushing coalesced batch"
        );
        self.executions.fetch_add(1, Ordering::Relaxed);

        match executor.fetch(batch.keys).await {
            Ok(results) => {
                for (key, value) in &results {
                    self.cache.set(batch_id, key, value.clone(), None);
                }
                for (key, waiter) in batch.waiters {
                    let outcome = match results.get(&key) {
                        Some(value) => Ok(value.clone()),
                        None => Err(ResilienceError::BatchKeyMissing {
                            batch_id: batch_id.to_string(),
                            key,
                        }),
                    };
                    // A dropped receiver just means the caller gave up.
                    let _ = waiter.send(outcome);
                }
            }
            Err(err) => {
                warn!(batch = %batch_id, error = %err, "batch executor failed");
                let message = err.to_string();
                for (_, waiter) in batch.waiters {
                    let _ = waiter.send(Err(ResilienceError::upstream(
                        batch_id,
                        message.clone().into(),
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn batcher(window_ms: u64) -> Arc<Batcher> {
        let cache = Arc::new(
            ResponseCache::new(CacheConfig {
                default_ttl: Duration::from_secs(60),
                max_items: 100,
            })
            .unwrap(),
        );
        Arc::new(Batcher::new(Duration::from_millis(window_ms), cache))
    }

    fn echo_executor(invocations: Arc<AtomicU32>, seen_keys: Arc<Mutex<Vec<Vec<String>>>>) -> Arc<dyn BatchExecutor> {
        Arc::new(BatchFn(move |keys: Vec<String>| {
            let invocations = invocations.clone();
            let seen_keys = seen_keys.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                seen_keys.lock().push(keys.clone());
                Ok(keys
                    .into_iter()
                    .map(|k| (k.clone(), json!({ "key": k })))
                    .collect::<HashMap<_, _>>())
            }
        }))
    }

    #[tokio::test]
    async fn same_batch_keys_coalesce_into_one_execution() {
        let batcher = batcher(20);
        let invocations = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = echo_executor(invocations.clone(), seen.clone());

        let (a, b, c) = tokio::join!(
            batcher.request("rooms", "a", executor.clone()),
            batcher.request("rooms", "b", executor.clone()),
            batcher.request("rooms", "c", executor.clone()),
        );

        assert_eq!(a.unwrap(), json!({"key": "a"}));
        assert_eq!(b.unwrap(), json!({"key": "b"}));
        assert_eq!(c.unwrap(), json!({"key": "c"}));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let batches = seen.lock();
        assert_eq!(batches.len(), 1);
        let mut keys = batches[0].clone();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(batcher.coalesced(), 2);
    }

    #[tokio::test]
    async fn distinct_batch_ids_do_not_coalesce() {
        let batcher = batcher(20);
        let invocations = Arc::new(AtomicU32::new(0));
        let executor = echo_executor(invocations.clone(), Arc::new(Mutex::new(Vec::new())));

        let (a, b) = tokio::join!(
            batcher.request("rooms", "a", executor.clone()),
            batcher.request("recordings", "a", executor.clone()),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn call_after_window_opens_a_new_batch() {
        let batcher = batcher(10);
        let invocations = Arc::new(AtomicU32::new(0));
        let executor = echo_executor(invocations.clone(), Arc::new(Mutex::new(Vec::new())));

        batcher.request("rooms", "a", executor.clone()).await.unwrap();
        // First batch has flushed; a new key starts a fresh window.
        batcher.request("rooms", "b", executor.clone()).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(batcher.pending_batches(), 0);
    }

    #[tokio::test]
    async fn cached_results_short_circuit() {
        let batcher = batcher(10);
        let invocations = Arc::new(AtomicU32::new(0));
        let executor = echo_executor(invocations.clone(), Arc::new(Mutex::new(Vec::new())));

        let first = batcher.request("rooms", "a", executor.clone()).await.unwrap();
        let second = batcher.request("rooms", "a", executor.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_in_executor_result_errors_that_waiter_only() {
        let batcher = batcher(20);
        let executor: Arc<dyn BatchExecutor> = Arc::new(BatchFn(|_keys: Vec<String>| async {
            let mut results = HashMap::new();
            results.insert("a".to_string(), json!(1));
            Ok(results)
        }));

        let (a, b) = tokio::join!(
            batcher.request("rooms", "a", executor.clone()),
            batcher.request("rooms", "b", executor.clone()),
        );
        assert_eq!(a.unwrap(), json!(1));
        assert!(matches!(
            b,
            Err(ResilienceError::BatchKeyMissing { .. })
        ));
    }

    #[tokio::test]
    async fn executor_failure_reaches_all_waiters() {
        let batcher = batcher(20);
        let executor: Arc<dyn BatchExecutor> = Arc::new(BatchFn(|_keys: Vec<String>| async {
            Err::<HashMap<String, Value>, BoxError>("backend exploded".into())
        }));

        let (a, b) = tokio::join!(
            batcher.request("rooms", "a", executor.clone()),
            batcher.request("rooms", "b", executor.clone()),
        );
        for outcome in [a, b] {
            match outcome {
                Err(ResilienceError::Upstream { source, .. }) => {
                    assert!(source.to_string().contains("backend exploded"));
                }
                other => panic!("expected upstream error, got {other:?}"),
            }
        }
    }
}
