//! Import Types
//!
//! Import items, per-item results and estimate counts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of importable item, with the wire codes used by the extension UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImportType {
    #[serde(rename = "h")]
    History,
    #[serde(rename = "b")]
    Bookmark,
    #[serde(rename = "o")]
    Other,
}

impl ImportType {
    /// All import types.
    pub const ALL: [ImportType; 3] = [Self::History, Self::Bookmark, Self::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::History => "h",
            Self::Bookmark => "b",
            Self::Other => "o",
        }
    }
}

impl std::fmt::Display for ImportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of import types enabled for a job.
///
/// On the wire this is an object mapping type codes to booleans.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<ImportType, bool>", into = "BTreeMap<ImportType, bool>")]
pub struct AllowTypes(BTreeSet<ImportType>);

impl AllowTypes {
    /// Allow every import type.
    pub fn all() -> Self {
        Self(ImportType::ALL.into_iter().collect())
    }

    /// Allow only the given types.
    pub fn only(types: impl IntoIterator<Item = ImportType>) -> Self {
        Self(types.into_iter().collect())
    }

    pub fn allows(&self, import_type: ImportType) -> bool {
        self.0.contains(&import_type)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ImportType> + '_ {
        self.0.iter().copied()
    }
}

impl From<BTreeMap<ImportType, bool>> for AllowTypes {
    fn from(map: BTreeMap<ImportType, bool>) -> Self {
        Self(
            map.into_iter()
                .filter_map(|(import_type, allowed)| allowed.then_some(import_type))
                .collect(),
        )
    }
}

impl From<AllowTypes> for BTreeMap<ImportType, bool> {
    fn from(allow: AllowTypes) -> Self {
        ImportType::ALL
            .into_iter()
            .map(|import_type| (import_type, allow.allows(import_type)))
            .collect()
    }
}

/// Opaque job options forwarded to the import state manager.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportOptions(pub serde_json::Map<String, serde_json::Value>);

impl ImportOptions {
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(serde_json::Value::as_bool)
    }
}

/// Unit of import work handed out by the state manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportItem {
    /// Stable identifier within the import state.
    pub id: String,
    /// Page URL to ingest.
    pub url: String,
    /// Kind of item.
    #[serde(rename = "type")]
    pub item_type: ImportType,
}

impl ImportItem {
    pub fn new(id: impl Into<String>, url: impl Into<String>, item_type: ImportType) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            item_type,
        }
    }
}

/// Outcome status of a processed item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Error,
}

/// Per-item result reported to the UI as a NEXT message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub item_type: ImportType,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl ItemResult {
    pub fn success(item: &ImportItem) -> Self {
        Self {
            id: item.id.clone(),
            url: item.url.clone(),
            item_type: item.item_type,
            status: ItemStatus::Success,
            err: None,
        }
    }

    pub fn failure(item: &ImportItem, err: Option<String>) -> Self {
        Self {
            id: item.id.clone(),
            url: item.url.clone(),
            item_type: item.item_type,
            status: ItemStatus::Error,
            err,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }
}

/// Remaining/completed counts per import type, sent to the UI as INIT.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimateCounts {
    pub remaining: BTreeMap<ImportType, u64>,
    pub completed: BTreeMap<ImportType, u64>,
}

impl EstimateCounts {
    pub fn total_remaining(&self) -> u64 {
        self.remaining.values().sum()
    }
}
