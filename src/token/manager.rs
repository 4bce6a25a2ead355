//! Token Manager
//!
//! Owns the in-memory access/refresh token state, keeps it in sync with the
//! token store, and refreshes the access token against the cloud backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{HttpRequest, HttpTransport};
use crate::error::{BackgroundError, ProtocolError, TokenError};
use crate::telemetry::BackgroundMetrics;
use crate::token::TokenStore;
use crate::types::{
    NewTokens, RefreshOutcome, RefreshRequest, RefreshResponse, TokenManagerConfig, TokenSet,
};

/// Token manager interface.
#[async_trait]
pub trait TokenManager: Send + Sync {
    /// Current access token. Never triggers a refresh.
    fn get_access_token(&self) -> Option<String>;

    /// Current refresh token.
    fn get_refresh_token(&self) -> Option<String>;

    /// Expiry of the current access token.
    fn access_token_expiry(&self) -> Option<DateTime<Utc>>;

    /// Check expiry against the configured margin.
    fn is_access_token_expired(&self) -> bool;

    /// Check expiry against an explicit margin.
    fn is_access_token_expired_within(&self, margin: Duration) -> bool;

    /// Apply tokens from an issuance response and persist them.
    async fn handle_new_tokens(&self, tokens: NewTokens) -> Result<(), BackgroundError>;

    /// Refresh the access token if it is inside the expiry margin, or always
    /// when `force` is set.
    async fn refresh_access_token(&self, force: bool) -> Result<RefreshOutcome, BackgroundError>;
}

/// Default token manager implementation.
pub struct DefaultTokenManager<T: HttpTransport, S: TokenStore> {
    config: TokenManagerConfig,
    transport: Arc<T>,
    store: Arc<S>,
    tokens: RwLock<TokenSet>,
    refresh_lock: tokio::sync::Mutex<()>,
    metrics: Option<Arc<BackgroundMetrics>>,
}

impl<T: HttpTransport, S: TokenStore> DefaultTokenManager<T, S> {
    /// Hydrate token state from the store and return a ready manager.
    ///
    /// Fails with [`TokenError::Initialization`] when the store cannot be read.
    /// Nothing is cached on failure, so the call can simply be retried.
    pub async fn initialize(
        config: TokenManagerConfig,
        transport: Arc<T>,
        store: Arc<S>,
    ) -> Result<Self, BackgroundError> {
        let access = store
            .retrieve_access_token()
            .await
            .map_err(initialization_error)?;
        let refresh = store
            .retrieve_refresh_token()
            .await
            .map_err(initialization_error)?;

        let (access_token, access_expiry_date) = match access {
            Some(stored) if !stored.token.is_empty() => {
                (Some(SecretString::new(stored.token)), stored.expiry_date)
            }
            _ => (None, None),
        };

        let tokens = TokenSet {
            access_token,
            refresh_token: refresh
                .filter(|token| !token.is_empty())
                .map(SecretString::new),
            access_expiry_date,
        };

        info!(
            endpoint = %config.refresh_endpoint,
            has_access_token = tokens.access_token.is_some(),
            has_refresh_token = tokens.refresh_token.is_some(),
            "Token manager initialized"
        );

        Ok(Self {
            config,
            transport,
            store,
            tokens: RwLock::new(tokens),
            refresh_lock: tokio::sync::Mutex::new(()),
            metrics: None,
        })
    }

    /// Attach a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<BackgroundMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Manager configuration.
    pub fn config(&self) -> &TokenManagerConfig {
        &self.config
    }

    fn read_tokens(&self) -> RwLockReadGuard<'_, TokenSet> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_tokens(&self, f: impl FnOnce(&mut TokenSet)) {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut tokens);
    }

    /// Applies both sub-updates; returns the new access expiry if one was applied.
    async fn apply_new_tokens(
        &self,
        tokens: &NewTokens,
    ) -> Result<Option<DateTime<Utc>>, BackgroundError> {
        let mut applied_expiry = None;

        if let Some((token, expires_in_seconds)) = tokens.access_update() {
            let expiry = expiry_from_now(expires_in_seconds)?;
            self.update_tokens(|state| {
                state.access_token = Some(SecretString::new(token.to_string()));
                state.access_expiry_date = Some(expiry);
            });
            self.store.store_access_token(token, expiry).await?;
            debug!(expires_at = %expiry, "Stored new access token");
            applied_expiry = Some(expiry);
        }

        if let Some(refresh_token) = tokens.refresh_update() {
            self.update_tokens(|state| {
                state.refresh_token = Some(SecretString::new(refresh_token.to_string()));
            });
            self.store.store_refresh_token(refresh_token).await?;
            debug!("Stored new refresh token");
        }

        Ok(applied_expiry)
    }

    fn reject(&self, reason: String) -> RefreshOutcome {
        let error = TokenError::RefreshFailed {
            message: reason.clone(),
        };
        warn!(error = %error, "Access token refresh rejected");
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh_failure();
        }
        RefreshOutcome::Rejected { reason }
    }

    async fn send_refresh(&self) -> Result<RefreshOutcome, BackgroundError> {
        let refresh_token = self.get_refresh_token();
        if refresh_token.is_none() {
            debug!("Refreshing without a stored refresh token");
        }

        let body = serde_json::to_string(&RefreshRequest {
            refresh_token: refresh_token.as_deref(),
        })
        .map_err(|e| ProtocolError::InvalidJson {
            message: e.to_string(),
        })?;

        let request =
            HttpRequest::post_json(&self.config.refresh_endpoint, body).with_timeout(self.config.timeout);
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            return Ok(self.reject(format!(
                "refresh endpoint returned status {}",
                response.status
            )));
        }

        let parsed: RefreshResponse = match serde_json::from_str(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(self.reject(format!("invalid refresh response: {}", e))),
        };

        let new_tokens = NewTokens {
            access_token: parsed.access_token,
            refresh_token: None,
            expires_in_seconds: parsed.expires_in_seconds,
        };

        match self.apply_new_tokens(&new_tokens).await? {
            Some(expires_at) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_token_refresh();
                }
                info!(expires_at = %expires_at, "Access token refreshed");
                Ok(RefreshOutcome::Refreshed { expires_at })
            }
            None => Ok(self.reject(
                "refresh response missing accessToken or expiresInSeconds".to_string(),
            )),
        }
    }
}

fn initialization_error(error: BackgroundError) -> BackgroundError {
    TokenError::Initialization {
        message: error.to_string(),
    }
    .into()
}

fn expiry_from_now(expires_in_seconds: u64) -> Result<DateTime<Utc>, BackgroundError> {
    i64::try_from(expires_in_seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| {
            ProtocolError::InvalidResponse {
                message: format!("token lifetime out of range: {}s", expires_in_seconds),
            }
            .into()
        })
}

#[async_trait]
impl<T: HttpTransport, S: TokenStore> TokenManager for DefaultTokenManager<T, S> {
    fn get_access_token(&self) -> Option<String> {
        self.read_tokens().access_token()
    }

    fn get_refresh_token(&self) -> Option<String> {
        self.read_tokens().refresh_token()
    }

    fn access_token_expiry(&self) -> Option<DateTime<Utc>> {
        self.read_tokens().access_expiry_date
    }

    fn is_access_token_expired(&self) -> bool {
        self.is_access_token_expired_within(self.config.expiry_margin)
    }

    fn is_access_token_expired_within(&self, margin: Duration) -> bool {
        self.read_tokens().is_expired_at(Utc::now(), margin)
    }

    async fn handle_new_tokens(&self, tokens: NewTokens) -> Result<(), BackgroundError> {
        self.apply_new_tokens(&tokens).await.map(|_| ())
    }

    async fn refresh_access_token(&self, force: bool) -> Result<RefreshOutcome, BackgroundError> {
        if !force && !self.is_access_token_expired() {
            return Ok(RefreshOutcome::NotNeeded);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if !force && !self.is_access_token_expired() {
            debug!("Access token refreshed by a concurrent caller");
            return Ok(RefreshOutcome::NotNeeded);
        }

        self.send_refresh().await
    }
}
