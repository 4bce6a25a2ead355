//! Background Services
//!
//! High-level entry point wiring storage, transport, the token manager and
//! import connections together.

use std::sync::Arc;
use tracing::info;

use crate::core::{
    HttpTransport, InMemoryKeyValueStore, JsonFileKeyValueStore, KeyValueStore,
    ReqwestHttpTransport,
};
use crate::error::BackgroundError;
use crate::imports::{
    ImportConnectionHandler, ImportItemProcessor, ImportProgressFlag, ImportServices,
    ImportStateManager, MessagePort,
};
use crate::telemetry::BackgroundMetrics;
use crate::token::{DefaultTokenManager, KeyValueTokenStore};
use crate::types::BackgroundConfig;

/// Token manager persisting through the shared key-value store.
pub type StoreTokenManager<T> = DefaultTokenManager<T, KeyValueTokenStore<dyn KeyValueStore>>;

/// Background services for one extension process.
pub struct BackgroundServices<T: HttpTransport = ReqwestHttpTransport> {
    config: BackgroundConfig,
    store: Arc<dyn KeyValueStore>,
    token_manager: Arc<StoreTokenManager<T>>,
    metrics: Arc<BackgroundMetrics>,
}

impl BackgroundServices<ReqwestHttpTransport> {
    /// Open services with the default reqwest transport.
    ///
    /// State is persisted to `storage_path` when configured, otherwise kept in
    /// memory.
    pub async fn open(config: BackgroundConfig) -> Result<Self, BackgroundError> {
        let store: Arc<dyn KeyValueStore> = match &config.storage_path {
            Some(path) => Arc::new(JsonFileKeyValueStore::open(path).await?),
            None => Arc::new(InMemoryKeyValueStore::new()),
        };
        let transport = Arc::new(ReqwestHttpTransport::with_timeout(config.request_timeout)?);

        Self::with_components(config, transport, store).await
    }
}

impl<T: HttpTransport> BackgroundServices<T> {
    /// Create services with custom components.
    ///
    /// Token state is hydrated from `store` before this returns.
    pub async fn with_components(
        config: BackgroundConfig,
        transport: Arc<T>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, BackgroundError> {
        let metrics = Arc::new(BackgroundMetrics::new());
        let token_store = Arc::new(KeyValueTokenStore::new(
            store.clone(),
            config.token_prefix.clone(),
        ));

        let token_manager =
            DefaultTokenManager::initialize(config.token_manager_config()?, transport, token_store)
                .await?
                .with_metrics(metrics.clone());

        info!(origin = %config.cloud_origin, "Background services ready");

        Ok(Self {
            config,
            store,
            token_manager: Arc::new(token_manager),
            metrics,
        })
    }

    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    /// Shared token manager.
    pub fn token_manager(&self) -> Arc<StoreTokenManager<T>> {
        self.token_manager.clone()
    }

    pub fn metrics(&self) -> Arc<BackgroundMetrics> {
        self.metrics.clone()
    }

    /// Durable import progress flag over the shared store.
    pub fn import_flag(&self) -> ImportProgressFlag {
        ImportProgressFlag::new(self.store.clone())
    }

    /// Attach a new imports UI connection.
    pub async fn connect_imports(
        &self,
        port: Arc<dyn MessagePort>,
        state_manager: Arc<dyn ImportStateManager>,
        processor: Arc<dyn ImportItemProcessor>,
    ) -> Result<ImportConnectionHandler, BackgroundError> {
        let services = ImportServices {
            state_manager,
            processor,
            flag: self.import_flag(),
            metrics: Some(self.metrics.clone()),
        };

        ImportConnectionHandler::connect(port, services, self.config.import_config()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MockHttpTransport;
    use crate::imports::{ChannelPort, InMemoryImportStateManager, MockItemProcessor};
    use crate::token::TokenManager;
    use crate::types::{NewTokens, OutboundMessage, RefreshOutcome};
    use serde_json::json;

    fn config() -> BackgroundConfig {
        BackgroundConfig::builder()
            .cloud_origin("https://memex.test")
            .token_prefix("drive-")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tokens_persist_under_prefix() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let transport = Arc::new(MockHttpTransport::new());
        let services = BackgroundServices::with_components(config(), transport, store.clone())
            .await
            .unwrap();

        services
            .token_manager()
            .handle_new_tokens(NewTokens {
                access_token: Some("a-1".to_string()),
                refresh_token: Some("r-1".to_string()),
                expires_in_seconds: Some(3600),
            })
            .await
            .unwrap();

        assert_eq!(store.get("drive-access").await.unwrap(), Some(json!("a-1")));
        assert_eq!(store.get("drive-refresh").await.unwrap(), Some(json!("r-1")));
        assert!(store.get("drive-access-expiry").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_counts_in_shared_metrics() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(200, &json!({"accessToken": "a-1", "expiresInSeconds": 3600}));

        let services = BackgroundServices::with_components(config(), transport, store)
            .await
            .unwrap();
        let outcome = services.token_manager().refresh_access_token(false).await.unwrap();

        assert!(matches!(outcome, RefreshOutcome::Refreshed { .. }));
        assert_eq!(services.metrics().snapshot().token_refreshes, 1);
    }

    #[tokio::test]
    async fn test_open_with_file_storage_rehydrates() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackgroundConfig::builder()
            .cloud_origin("https://memex.test")
            .storage_path(dir.path().join("background.json"))
            .build()
            .unwrap();

        {
            let services = BackgroundServices::open(config.clone()).await.unwrap();
            services
                .token_manager()
                .handle_new_tokens(NewTokens {
                    access_token: Some("a-1".to_string()),
                    refresh_token: Some("r-1".to_string()),
                    expires_in_seconds: Some(3600),
                })
                .await
                .unwrap();
            services.import_flag().set().await.unwrap();
        }

        let services = BackgroundServices::open(config).await.unwrap();
        let manager = services.token_manager();
        assert_eq!(manager.get_access_token().as_deref(), Some("a-1"));
        assert_eq!(manager.get_refresh_token().as_deref(), Some("r-1"));
        assert!(!manager.is_access_token_expired());

        let (port, mut rx) = ChannelPort::new();
        let handler = services
            .connect_imports(
                Arc::new(port),
                Arc::new(InMemoryImportStateManager::new()),
                Arc::new(MockItemProcessor::new()),
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(OutboundMessage::Pause));
        assert!(handler.is_import_in_progress().await.unwrap());
    }
}
