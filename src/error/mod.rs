//! Error Types
//!
//! Error hierarchy for credential lifecycle and import coordination.

use std::time::Duration;
use thiserror::Error;

/// Root error type for the background services.
#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Import error: {0}")]
    Import(#[from] ImportError),
}

impl BackgroundError {
    /// Get error code for telemetry.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "BG_CONFIG",
            Self::Token(_) => "BG_TOKEN",
            Self::Network(_) => "BG_NETWORK",
            Self::Storage(_) => "BG_STORAGE",
            Self::Protocol(_) => "BG_PROTOCOL",
            Self::Import(_) => "BG_IMPORT",
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_retryable(),
            Self::Token(TokenError::Initialization { .. }) => true,
            Self::Storage(StorageError::ReadFailed { .. })
            | Self::Storage(StorageError::WriteFailed { .. }) => true,
            _ => false,
        }
    }

    /// Check if error means the user must sign in again.
    pub fn needs_reauth(&self) -> bool {
        matches!(
            self,
            Self::Token(TokenError::RefreshFailed { .. }) | Self::Token(TokenError::NoAccessToken)
        )
    }
}

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid endpoint URL: {url}")]
    InvalidEndpoint { url: String },
}

/// Token-related error.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token manager initialization failed: {message}")]
    Initialization { message: String },

    #[error("Token refresh failed: {message}")]
    RefreshFailed { message: String },

    #[error("No access token available")]
    NoAccessToken,
}

/// Network/transport error.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Client setup failed: {message}")]
    ClientSetup { message: String },
}

impl NetworkError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ClientSetup { .. })
    }
}

/// Protocol/response parsing error.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Unexpected redirect to: {location}")]
    UnexpectedRedirect { location: String },

    #[error("Response too large: {size} bytes")]
    ResponseTooLarge { size: usize },

    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },
}

/// Storage error.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("Corrupted data under {key}: {message}")]
    CorruptedData { key: String, message: String },
}

/// Import coordination error.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Import item {id} failed: {message}")]
    ItemFailed { id: String, message: String },

    #[error("Unknown command: {cmd}")]
    UnknownCommand { cmd: String },

    #[error("Invalid payload for {cmd}: {message}")]
    InvalidPayload { cmd: String, message: String },

    #[error("Import state unavailable: {message}")]
    StateManager { message: String },

    #[error("UI message port closed")]
    PortClosed,
}

/// Result type for background operations.
pub type BackgroundResult<T> = Result<T, BackgroundError>;
