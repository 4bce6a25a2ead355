//! Import State Manager
//!
//! Bookkeeping of importable items: estimates, the pending-item supply and
//! per-item outcomes.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{BackgroundError, ImportError};
use crate::types::{AllowTypes, EstimateCounts, ImportItem, ImportOptions, ImportType, ItemResult};

/// Import state interface used by the connection handler and the progress
/// manager.
#[async_trait]
pub trait ImportStateManager: Send + Sync {
    /// Compute (or return cached) remaining/completed counts.
    ///
    /// `blob_url` names an uploaded bookmark file whose items join the supply.
    /// With `include_errors`, items that previously failed are queued again.
    async fn fetch_estimates(
        &self,
        blob_url: Option<&str>,
        quick_mode: bool,
        include_errors: bool,
    ) -> Result<EstimateCounts, BackgroundError>;

    /// Drop cached estimates so the next fetch recomputes them.
    async fn dirty_estimates_cache(&self);

    async fn set_allow_types(&self, allow_types: AllowTypes);

    async fn set_options(&self, options: ImportOptions);

    /// Hand out the next pending item. `None` when the supply is exhausted.
    async fn claim_next(&self) -> Result<Option<ImportItem>, BackgroundError>;

    /// Record the outcome of a claimed item.
    async fn record_outcome(
        &self,
        item: &ImportItem,
        result: &ItemResult,
    ) -> Result<(), BackgroundError>;
}

#[derive(Default)]
struct ImportState {
    pending: VecDeque<ImportItem>,
    claimed: HashMap<String, ImportItem>,
    failed: BTreeMap<String, ImportItem>,
    done: HashSet<String>,
    completed: BTreeMap<ImportType, u64>,
    blobs: HashMap<String, Vec<ImportItem>>,
    allow_types: AllowTypes,
    options: ImportOptions,
    quick_mode: bool,
    cached_estimates: Option<EstimateCounts>,
    unavailable: bool,
}

impl ImportState {
    fn is_known(&self, id: &str) -> bool {
        self.done.contains(id)
            || self.claimed.contains_key(id)
            || self.failed.contains_key(id)
            || self.pending.iter().any(|item| item.id == id)
    }

    fn enqueue(&mut self, item: ImportItem) -> bool {
        if self.is_known(&item.id) {
            return false;
        }
        self.pending.push_back(item);
        true
    }

    fn is_eligible(&self, item_type: ImportType) -> bool {
        if self.quick_mode && item_type != ImportType::History {
            return false;
        }
        self.allow_types.allows(item_type)
    }

    fn compute_estimates(&self) -> EstimateCounts {
        let mut remaining: BTreeMap<ImportType, u64> =
            ImportType::ALL.into_iter().map(|t| (t, 0)).collect();
        for item in self.pending.iter() {
            if self.quick_mode && item.item_type != ImportType::History {
                continue;
            }
            *remaining.entry(item.item_type).or_default() += 1;
        }

        let completed = ImportType::ALL
            .into_iter()
            .map(|t| (t, self.completed.get(&t).copied().unwrap_or(0)))
            .collect();

        EstimateCounts {
            remaining,
            completed,
        }
    }

    fn check_available(&self) -> Result<(), BackgroundError> {
        if self.unavailable {
            return Err(ImportError::StateManager {
                message: "import state is unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// In-memory import state.
///
/// Items are supplied up front through [`add_items`](Self::add_items) or
/// registered per bookmark-file blob URL and merged on the first estimate
/// fetch that names the blob.
#[derive(Default)]
pub struct InMemoryImportStateManager {
    state: Mutex<ImportState>,
}

impl InMemoryImportStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add items to the pending supply. Already known ids are skipped.
    pub fn add_items(&self, items: impl IntoIterator<Item = ImportItem>) -> usize {
        let mut state = self.state.lock().unwrap();
        let added = items.into_iter().filter(|item| state.enqueue(item.clone())).count();
        if added > 0 {
            state.cached_estimates = None;
        }
        added
    }

    /// Register the items of an uploaded bookmark file.
    pub fn register_blob(&self, blob_url: impl Into<String>, items: Vec<ImportItem>) {
        self.state.lock().unwrap().blobs.insert(blob_url.into(), items);
    }

    /// Make every fallible operation fail, simulating an unreadable backing store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn claimed_count(&self) -> usize {
        self.state.lock().unwrap().claimed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.state.lock().unwrap().failed.len()
    }

    pub fn done_count(&self) -> usize {
        self.state.lock().unwrap().done.len()
    }

    pub fn allow_types(&self) -> AllowTypes {
        self.state.lock().unwrap().allow_types.clone()
    }

    pub fn options(&self) -> ImportOptions {
        self.state.lock().unwrap().options.clone()
    }
}

#[async_trait]
impl ImportStateManager for InMemoryImportStateManager {
    async fn fetch_estimates(
        &self,
        blob_url: Option<&str>,
        quick_mode: bool,
        include_errors: bool,
    ) -> Result<EstimateCounts, BackgroundError> {
        let mut state = self.state.lock().unwrap();
        state.check_available()?;

        if state.quick_mode != quick_mode {
            state.quick_mode = quick_mode;
            state.cached_estimates = None;
        }

        if let Some(url) = blob_url {
            let items = state
                .blobs
                .get(url)
                .cloned()
                .ok_or_else(|| ImportError::StateManager {
                    message: format!("unknown bookmark file: {}", url),
                })?;
            let added = items.into_iter().filter(|item| state.enqueue(item.clone())).count();
            if added > 0 {
                debug!(blob_url = url, added, "Merged bookmark file items");
                state.cached_estimates = None;
            }
        }

        if include_errors && !state.failed.is_empty() {
            let failed = std::mem::take(&mut state.failed);
            debug!(count = failed.len(), "Re-queueing failed items");
            state.pending.extend(failed.into_values());
            state.cached_estimates = None;
        }

        if let Some(cached) = &state.cached_estimates {
            return Ok(cached.clone());
        }

        let estimates = state.compute_estimates();
        state.cached_estimates = Some(estimates.clone());
        Ok(estimates)
    }

    async fn dirty_estimates_cache(&self) {
        self.state.lock().unwrap().cached_estimates = None;
    }

    async fn set_allow_types(&self, allow_types: AllowTypes) {
        self.state.lock().unwrap().allow_types = allow_types;
    }

    async fn set_options(&self, options: ImportOptions) {
        self.state.lock().unwrap().options = options;
    }

    async fn claim_next(&self) -> Result<Option<ImportItem>, BackgroundError> {
        let mut state = self.state.lock().unwrap();
        state.check_available()?;

        let Some(position) = state
            .pending
            .iter()
            .position(|item| state.is_eligible(item.item_type))
        else {
            return Ok(None);
        };

        let Some(item) = state.pending.remove(position) else {
            return Ok(None);
        };
        state.claimed.insert(item.id.clone(), item.clone());
        Ok(Some(item))
    }

    async fn record_outcome(
        &self,
        item: &ImportItem,
        result: &ItemResult,
    ) -> Result<(), BackgroundError> {
        let mut state = self.state.lock().unwrap();
        state.check_available()?;

        state.claimed.remove(&item.id);
        if result.is_success() {
            state.done.insert(item.id.clone());
            *state.completed.entry(item.item_type).or_default() += 1;
        } else {
            state.failed.insert(item.id.clone(), item.clone());
        }
        state.cached_estimates = None;
        Ok(())
    }
}
