//! Configuration Types
//!
//! Configuration for the token manager and the import coordinator.

use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::builders::BackgroundConfigBuilder;
use crate::error::{BackgroundError, ConfigurationError};

/// Path of the token refresh endpoint, relative to the cloud origin.
pub const REFRESH_ENDPOINT_PATH: &str = "/auth/google/refresh";

/// Default key prefix for persisted tokens.
pub const DEFAULT_TOKEN_PREFIX: &str = "google-drive-";

/// Default proactive refresh margin (10 minutes).
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_millis(600_000);

/// Default HTTP timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of import items processed at once.
pub const DEFAULT_IMPORT_CONCURRENCY: usize = 1;

/// Top-level configuration for the background services.
#[derive(Clone, Debug)]
pub struct BackgroundConfig {
    /// Origin of the cloud backend issuing tokens.
    pub cloud_origin: Url,
    /// Namespace prefix for persisted token keys.
    pub token_prefix: String,
    /// Refresh tokens this long before they expire.
    pub expiry_margin: Duration,
    /// HTTP timeout.
    pub request_timeout: Duration,
    /// Initial import concurrency.
    pub import_concurrency: usize,
    /// Quick imports of recent history (onboarding).
    pub quick_mode: bool,
    /// JSON file backing the key-value store. In-memory when unset.
    pub storage_path: Option<PathBuf>,
}

impl BackgroundConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> BackgroundConfigBuilder {
        BackgroundConfigBuilder::new()
    }

    /// Creates a configuration from `MEMEX_*` environment variables.
    pub fn from_env() -> Result<Self, BackgroundError> {
        BackgroundConfigBuilder::from_env()?.build()
    }

    /// Token manager settings derived from this configuration.
    pub fn token_manager_config(&self) -> Result<TokenManagerConfig, BackgroundError> {
        TokenManagerConfig::for_origin(&self.cloud_origin)
            .map(|config| config.expiry_margin(self.expiry_margin).timeout(self.request_timeout))
    }

    /// Import coordinator settings derived from this configuration.
    pub fn import_config(&self) -> ImportConfig {
        ImportConfig {
            concurrency: self.import_concurrency,
            quick_mode: self.quick_mode,
        }
    }
}

/// Token manager configuration.
#[derive(Clone, Debug)]
pub struct TokenManagerConfig {
    /// Full URL of the refresh endpoint.
    pub refresh_endpoint: String,
    /// Margin used by the default expiry check.
    pub expiry_margin: Duration,
    /// HTTP timeout for refresh requests.
    pub timeout: Duration,
}

impl TokenManagerConfig {
    /// Configuration targeting `{origin}/auth/google/refresh`.
    pub fn for_origin(origin: &Url) -> Result<Self, BackgroundError> {
        let endpoint = origin.join(REFRESH_ENDPOINT_PATH).map_err(|_| {
            ConfigurationError::InvalidEndpoint {
                url: format!("{}{}", origin, REFRESH_ENDPOINT_PATH),
            }
        })?;

        Ok(Self {
            refresh_endpoint: endpoint.to_string(),
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Import coordinator configuration.
#[derive(Clone, Debug)]
pub struct ImportConfig {
    /// Initial concurrency bound.
    pub concurrency: usize,
    /// Quick mode restricts estimates and processing to recent history.
    pub quick_mode: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_IMPORT_CONCURRENCY,
            quick_mode: false,
        }
    }
}
