//! Import item processing.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ImportError;
use crate::types::ImportItem;

/// Processes a single import item (fetch, index, tag).
#[async_trait]
pub trait ImportItemProcessor: Send + Sync {
    async fn process(&self, item: &ImportItem) -> Result<(), ImportError>;
}

/// Mock item processor for testing.
#[derive(Default)]
pub struct MockItemProcessor {
    processed: Mutex<Vec<String>>,
    failing_ids: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MockItemProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated processing time per item.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = delay;
        self
    }

    /// Make processing of the given item fail.
    pub fn fail_item(&self, id: impl Into<String>) -> &Self {
        self.failing_ids.lock().unwrap().insert(id.into());
        self
    }

    /// Ids of processed items, in completion order.
    pub fn processed_ids(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }

    pub fn process_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }

    /// Highest number of items processed at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImportItemProcessor for MockItemProcessor {
    async fn process(&self, item: &ImportItem) -> Result<(), ImportError> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.processed.lock().unwrap().push(item.id.clone());

        if self.failing_ids.lock().unwrap().contains(&item.id) {
            return Err(ImportError::ItemFailed {
                id: item.id.clone(),
                message: "Mock processing failure".to_string(),
            });
        }
        Ok(())
    }
}
