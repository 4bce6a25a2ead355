//! Token Storage
//!
//! Persistence of access/refresh token material under a key prefix.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::core::KeyValueStore;
use crate::error::{BackgroundError, StorageError};
use crate::types::StoredAccessToken;

/// Token store interface.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist the access token and its expiry.
    async fn store_access_token(
        &self,
        token: &str,
        expiry_date: DateTime<Utc>,
    ) -> Result<(), BackgroundError>;

    /// Load the access token and its expiry.
    async fn retrieve_access_token(&self) -> Result<Option<StoredAccessToken>, BackgroundError>;

    /// Persist the refresh token.
    async fn store_refresh_token(&self, token: &str) -> Result<(), BackgroundError>;

    /// Load the refresh token.
    async fn retrieve_refresh_token(&self) -> Result<Option<String>, BackgroundError>;
}

/// Token store over a [`KeyValueStore`], one key per field.
///
/// Keys are `<prefix>access`, `<prefix>access-expiry` (epoch milliseconds as a
/// string) and `<prefix>refresh`.
pub struct KeyValueTokenStore<K: KeyValueStore + ?Sized> {
    store: Arc<K>,
    prefix: String,
}

impl<K: KeyValueStore + ?Sized> KeyValueTokenStore<K> {
    /// Create new prefixed token store.
    pub fn new(store: Arc<K>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, BackgroundError> {
        match self.store.get(key).await? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(StorageError::CorruptedData {
                key: key.to_string(),
                message: format!("expected string, found {}", other),
            }
            .into()),
        }
    }
}

fn parse_expiry(key: &str, raw: &str) -> Result<DateTime<Utc>, BackgroundError> {
    let corrupted = |message: String| StorageError::CorruptedData {
        key: key.to_string(),
        message,
    };

    let millis = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| corrupted(e.to_string()))?;

    if !millis.is_finite() {
        return Err(corrupted(format!("non-finite expiry {}", raw)).into());
    }

    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .ok_or_else(|| corrupted(format!("expiry out of range: {}", raw)).into())
}

#[async_trait]
impl<K: KeyValueStore + ?Sized> TokenStore for KeyValueTokenStore<K> {
    async fn store_access_token(
        &self,
        token: &str,
        expiry_date: DateTime<Utc>,
    ) -> Result<(), BackgroundError> {
        self.store
            .set(&self.key("access"), Value::String(token.to_string()))
            .await?;
        self.store
            .set(
                &self.key("access-expiry"),
                Value::String(expiry_date.timestamp_millis().to_string()),
            )
            .await
    }

    async fn retrieve_access_token(&self) -> Result<Option<StoredAccessToken>, BackgroundError> {
        let Some(token) = self.get_string(&self.key("access")).await? else {
            return Ok(None);
        };

        let expiry_key = self.key("access-expiry");
        let expiry_date = match self.get_string(&expiry_key).await? {
            Some(raw) if !raw.is_empty() => Some(parse_expiry(&expiry_key, &raw)?),
            _ => None,
        };

        Ok(Some(StoredAccessToken { token, expiry_date }))
    }

    async fn store_refresh_token(&self, token: &str) -> Result<(), BackgroundError> {
        self.store
            .set(&self.key("refresh"), Value::String(token.to_string()))
            .await
    }

    async fn retrieve_refresh_token(&self) -> Result<Option<String>, BackgroundError> {
        self.get_string(&self.key("refresh")).await
    }
}

/// Mock token store for testing.
#[derive(Default)]
pub struct MockTokenStore {
    access: Mutex<Option<StoredAccessToken>>,
    refresh: Mutex<Option<String>>,
    store_history: Mutex<Vec<String>>,
    retrieve_count: Mutex<usize>,
    should_fail: Mutex<bool>,
}

impl MockTokenStore {
    /// Create new mock token store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the access token.
    pub fn with_access_token(self, token: &str, expiry_date: Option<DateTime<Utc>>) -> Self {
        *self.access.lock().unwrap() = Some(StoredAccessToken {
            token: token.to_string(),
            expiry_date,
        });
        self
    }

    /// Pre-populate the refresh token.
    pub fn with_refresh_token(self, token: &str) -> Self {
        *self.refresh.lock().unwrap() = Some(token.to_string());
        self
    }

    /// Set store to fail all operations.
    pub fn set_should_fail(&self, should_fail: bool) -> &Self {
        *self.should_fail.lock().unwrap() = should_fail;
        self
    }

    /// Names of the writes performed (`"access"` / `"refresh"`), in order.
    pub fn get_store_history(&self) -> Vec<String> {
        self.store_history.lock().unwrap().clone()
    }

    /// Number of retrieve calls.
    pub fn retrieve_count(&self) -> usize {
        *self.retrieve_count.lock().unwrap()
    }

    /// Currently stored access token.
    pub fn stored_access_token(&self) -> Option<StoredAccessToken> {
        self.access.lock().unwrap().clone()
    }

    /// Currently stored refresh token.
    pub fn stored_refresh_token(&self) -> Option<String> {
        self.refresh.lock().unwrap().clone()
    }

    fn check_error(&self) -> Result<(), BackgroundError> {
        if *self.should_fail.lock().unwrap() {
            return Err(StorageError::ReadFailed {
                message: "Mock storage failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MockTokenStore {
    async fn store_access_token(
        &self,
        token: &str,
        expiry_date: DateTime<Utc>,
    ) -> Result<(), BackgroundError> {
        self.check_error()?;
        self.store_history.lock().unwrap().push("access".to_string());
        *self.access.lock().unwrap() = Some(StoredAccessToken {
            token: token.to_string(),
            expiry_date: Some(expiry_date),
        });
        Ok(())
    }

    async fn retrieve_access_token(&self) -> Result<Option<StoredAccessToken>, BackgroundError> {
        self.check_error()?;
        *self.retrieve_count.lock().unwrap() += 1;
        Ok(self.access.lock().unwrap().clone())
    }

    async fn store_refresh_token(&self, token: &str) -> Result<(), BackgroundError> {
        self.check_error()?;
        self.store_history.lock().unwrap().push("refresh".to_string());
        *self.refresh.lock().unwrap() = Some(token.to_string());
        Ok(())
    }

    async fn retrieve_refresh_token(&self) -> Result<Option<String>, BackgroundError> {
        self.check_error()?;
        *self.retrieve_count.lock().unwrap() += 1;
        Ok(self.refresh.lock().unwrap().clone())
    }
}
