//! Configuration Builder
//!
//! Fluent builder for the background services configuration.

use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{BackgroundError, ConfigurationError};
use crate::types::{
    BackgroundConfig, DEFAULT_EXPIRY_MARGIN, DEFAULT_IMPORT_CONCURRENCY, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_TOKEN_PREFIX,
};

/// Environment variable names read by [`BackgroundConfigBuilder::from_env`].
pub mod env {
    pub const CLOUD_ORIGIN: &str = "MEMEX_CLOUD_ORIGIN";
    pub const TOKEN_PREFIX: &str = "MEMEX_TOKEN_PREFIX";
    pub const EXPIRY_MARGIN_MS: &str = "MEMEX_TOKEN_EXPIRY_MARGIN_MS";
    pub const REQUEST_TIMEOUT_SECS: &str = "MEMEX_REQUEST_TIMEOUT_SECS";
    pub const IMPORT_CONCURRENCY: &str = "MEMEX_IMPORT_CONCURRENCY";
    pub const IMPORT_QUICK: &str = "MEMEX_IMPORT_QUICK";
    pub const STORAGE_PATH: &str = "MEMEX_STORAGE_PATH";
}

/// Background configuration builder.
#[derive(Default)]
pub struct BackgroundConfigBuilder {
    cloud_origin: Option<String>,
    token_prefix: Option<String>,
    expiry_margin: Option<Duration>,
    request_timeout: Option<Duration>,
    import_concurrency: Option<usize>,
    quick_mode: bool,
    storage_path: Option<PathBuf>,
}

impl BackgroundConfigBuilder {
    /// Create new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder pre-populated from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MEMEX_CLOUD_ORIGIN` (required at build time): backend origin
    /// - `MEMEX_TOKEN_PREFIX` (optional): token key prefix
    /// - `MEMEX_TOKEN_EXPIRY_MARGIN_MS` (optional): refresh margin in milliseconds
    /// - `MEMEX_REQUEST_TIMEOUT_SECS` (optional): HTTP timeout in seconds
    /// - `MEMEX_IMPORT_CONCURRENCY` (optional): initial import concurrency
    /// - `MEMEX_IMPORT_QUICK` (optional): `true`/`1` enables quick mode
    /// - `MEMEX_STORAGE_PATH` (optional): JSON file for persisted state
    pub fn from_env() -> Result<Self, BackgroundError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, BackgroundError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::new();

        if let Some(origin) = lookup(env::CLOUD_ORIGIN) {
            builder = builder.cloud_origin(origin);
        }

        if let Some(prefix) = lookup(env::TOKEN_PREFIX) {
            builder = builder.token_prefix(prefix);
        }

        if let Some(value) = lookup(env::EXPIRY_MARGIN_MS) {
            let ms = parse_number::<u64>(env::EXPIRY_MARGIN_MS, &value)?;
            builder = builder.expiry_margin(Duration::from_millis(ms));
        }

        if let Some(value) = lookup(env::REQUEST_TIMEOUT_SECS) {
            let secs = parse_number::<u64>(env::REQUEST_TIMEOUT_SECS, &value)?;
            builder = builder.request_timeout(Duration::from_secs(secs));
        }

        if let Some(value) = lookup(env::IMPORT_CONCURRENCY) {
            builder = builder.import_concurrency(parse_number(env::IMPORT_CONCURRENCY, &value)?);
        }

        if let Some(value) = lookup(env::IMPORT_QUICK) {
            builder = builder.quick_mode(matches!(value.trim(), "1" | "true" | "TRUE" | "yes"));
        }

        if let Some(path) = lookup(env::STORAGE_PATH) {
            builder = builder.storage_path(path);
        }

        Ok(builder)
    }

    /// Set the cloud origin.
    pub fn cloud_origin(mut self, origin: impl Into<String>) -> Self {
        self.cloud_origin = Some(origin.into());
        self
    }

    /// Set the token key prefix.
    pub fn token_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.token_prefix = Some(prefix.into());
        self
    }

    /// Set the proactive refresh margin.
    pub fn expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = Some(margin);
        self
    }

    /// Set request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set initial import concurrency.
    pub fn import_concurrency(mut self, concurrency: usize) -> Self {
        self.import_concurrency = Some(concurrency);
        self
    }

    /// Enable or disable quick mode.
    pub fn quick_mode(mut self, quick: bool) -> Self {
        self.quick_mode = quick;
        self
    }

    /// Persist state to a JSON file.
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<BackgroundConfig, BackgroundError> {
        let origin = self.cloud_origin.ok_or_else(|| ConfigurationError::MissingRequired {
            field: "cloud_origin".to_string(),
        })?;

        let cloud_origin = Url::parse(&origin)
            .map_err(|_| ConfigurationError::InvalidEndpoint { url: origin.clone() })?;

        if !matches!(cloud_origin.scheme(), "http" | "https") {
            return Err(ConfigurationError::InvalidEndpoint { url: origin }.into());
        }

        let import_concurrency = self.import_concurrency.unwrap_or(DEFAULT_IMPORT_CONCURRENCY);
        if import_concurrency == 0 {
            return Err(ConfigurationError::InvalidConfig {
                message: "import_concurrency must be at least 1".to_string(),
            }
            .into());
        }

        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        if request_timeout.is_zero() {
            return Err(ConfigurationError::InvalidConfig {
                message: "request_timeout must be non-zero".to_string(),
            }
            .into());
        }

        Ok(BackgroundConfig {
            cloud_origin,
            token_prefix: self
                .token_prefix
                .unwrap_or_else(|| DEFAULT_TOKEN_PREFIX.to_string()),
            expiry_margin: self.expiry_margin.unwrap_or(DEFAULT_EXPIRY_MARGIN),
            request_timeout,
            import_concurrency,
            quick_mode: self.quick_mode,
            storage_path: self.storage_path,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, BackgroundError> {
    value.trim().parse::<T>().map_err(|_| {
        ConfigurationError::InvalidConfig {
            message: format!("{} must be a number, got {:?}", key, value),
        }
        .into()
    })
}

/// Create a new background configuration builder.
pub fn background_config() -> BackgroundConfigBuilder {
    BackgroundConfigBuilder::new()
}
