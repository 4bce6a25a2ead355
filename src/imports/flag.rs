//! Durable "import in progress" flag.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::KeyValueStore;
use crate::error::BackgroundError;

/// Storage key of the flag.
pub const IMPORTS_PROGRESS_KEY: &str = "is-imports-in-progress";

/// Persisted marker that an import run was started and not yet finished or
/// cancelled. Survives UI disconnects and process restarts.
#[derive(Clone)]
pub struct ImportProgressFlag {
    store: Arc<dyn KeyValueStore>,
}

impl ImportProgressFlag {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Read the flag. A missing key reads as unset.
    pub async fn is_set(&self) -> Result<bool, BackgroundError> {
        match self.store.get(IMPORTS_PROGRESS_KEY).await? {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(value)) => Ok(value),
            Some(other) => {
                warn!(value = %other, "Ignoring non-boolean import progress flag");
                Ok(false)
            }
        }
    }

    pub async fn set(&self) -> Result<(), BackgroundError> {
        self.write(true).await
    }

    pub async fn clear(&self) -> Result<(), BackgroundError> {
        self.write(false).await
    }

    async fn write(&self, value: bool) -> Result<(), BackgroundError> {
        debug!(in_progress = value, "Updating import progress flag");
        self.store.set(IMPORTS_PROGRESS_KEY, Value::Bool(value)).await
    }
}
