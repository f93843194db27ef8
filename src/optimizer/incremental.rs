//! Incremental (paged) loading: fetch pages sequentially, report progress
//! after each page, and stop at the page cap or once the upstream's
//! reported total has been collected.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use tracing::debug;

use crate::error::{BoxError, ResilienceError, Result};

use super::{OptimizerEvent, ResourceOptimizer};

/// One page of upstream results plus the collection's reported total.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub data: Vec<Value>,
    pub total: u64,
}

/// Upstream pager: `load_page(page, page_size)`, pages are 1-based.
#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load_page(
        &self,
        page: u32,
        page_size: u32,
    ) -> std::result::Result<PageResult, BoxError>;
}

/// Adapter so plain async closures can serve as page loaders.
pub struct PageFn<F>(pub F);

#[async_trait]
impl<F, Fut> PageLoader for PageFn<F>
where
    F: Fn(u32, u32) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<PageResult, BoxError>> + Send,
{
    async fn load_page(
        &self,
        page: u32,
        page_size: u32,
    ) -> std::result::Result<PageResult, BoxError> {
        (self.0)(page, page_size).await
    }
}

/// Bounds for one incremental load.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalLoadOptions {
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for IncrementalLoadOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 10,
        }
    }
}

impl ResourceOptimizer {
    /// Load a collection page by page, emitting
    /// [`OptimizerEvent::LoadProgress`] after each page and
    /// [`OptimizerEvent::LoadComplete`] at the end. Stops at `max_pages`,
    /// when the reported total has been collected, or when the upstream
    /// returns an empty page.
    pub async fn load_incrementally(
        &self,
        loader: &dyn PageLoader,
        options: IncrementalLoadOptions,
    ) -> Result<Vec<Value>> {
        if options.page_size == 0 || options.max_pages == 0 {
            return Err(ResilienceError::Configuration(
                "incremental load requires non-zero page_size and max_pages".into(),
            ));
        }

        let mut items: Vec<Value> = Vec::new();
        let mut pages_fetched = 0;

        for page in 1..=options.max_pages {
            let result = loader
                .load_page(page, options.page_size)
                .await
                .map_err(|source| ResilienceError::upstream("incremental_load", source))?;
            pages_fetched = page;

            let page_len = result.data.len();
            items.extend(result.data);
            let loaded = items.len() as u64;
            let percentage = if result.total > 0 {
                ((loaded as f64 / result.total as f64) * 100.0).min(100.0)
            } else {
                100.0
            };

            debug!(page, loaded, total = result.total, "incremental page loaded");
            self.emit(OptimizerEvent::LoadProgress {
                page,
                loaded,
                total: result.total,
                percentage,
            });

            if (result.total > 0 && loaded >= result.total) || page_len == 0 {
                break;
            }
        }

        self.emit(OptimizerEvent::LoadComplete {
            pages: pages_fetched,
            loaded: items.len() as u64,
        });
        Ok(items)
    }
}
