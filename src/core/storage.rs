//! Key-Value Storage
//!
//! Generic persistence used for tokens and the import progress flag.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{BackgroundError, StorageError};

/// Async key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Value>, BackgroundError>;

    /// Write a value.
    async fn set(&self, key: &str, value: Value) -> Result<(), BackgroundError>;

    /// Remove a value, returning whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, BackgroundError>;
}

/// In-memory key-value store.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl InMemoryKeyValueStore {
    /// Create new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackgroundError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), BackgroundError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, BackgroundError> {
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }
}

/// Key-value store persisted as a single JSON object on disk.
///
/// Every write rewrites the file through a temporary sibling and a rename.
/// The in-memory view only changes once that write succeeded. Concurrent
/// writers in other processes are last-writer-wins.
pub struct JsonFileKeyValueStore {
    path: PathBuf,
    entries: tokio::sync::Mutex<Map<String, Value>>,
}

impl JsonFileKeyValueStore {
    /// Open the store, loading existing contents if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, BackgroundError> {
        let path = path.into();
        let entries = load_entries(&path).await?;

        tracing::debug!(path = %path.display(), keys = entries.len(), "Opened key-value store");

        Ok(Self {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &Map<String, Value>) -> Result<(), BackgroundError> {
        let contents = serde_json::to_vec_pretty(entries).map_err(|e| StorageError::WriteFailed {
            message: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, contents).await.map_err(write_failed)?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(write_failed)?;
        Ok(())
    }
}

async fn load_entries(path: &Path) -> Result<Map<String, Value>, BackgroundError> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => {
            return Err(StorageError::ReadFailed {
                message: format!("{}: {}", path.display(), e),
            }
            .into())
        }
    };

    if contents.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }

    serde_json::from_slice(&contents).map_err(|e| {
        StorageError::CorruptedData {
            key: path.display().to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

fn write_failed(e: std::io::Error) -> BackgroundError {
    StorageError::WriteFailed {
        message: e.to_string(),
    }
    .into()
}

#[async_trait]
impl KeyValueStore for JsonFileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackgroundError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), BackgroundError> {
        let mut entries = self.entries.lock().await;
        let mut updated = entries.clone();
        updated.insert(key.to_string(), value);
        self.persist(&updated).await?;
        *entries = updated;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, BackgroundError> {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(key) {
            return Ok(false);
        }
        let mut updated = entries.clone();
        updated.remove(key);
        self.persist(&updated).await?;
        *entries = updated;
        Ok(true)
    }
}
