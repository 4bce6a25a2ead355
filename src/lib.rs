//! Memex Background Services
//!
//! Credential lifecycle and import job coordination for the Memex browser
//! extension background process.
//!
//! # Features
//!
//! - Access/refresh token persistence with a prefixed key layout
//! - Proactive access token refresh against the cloud backend
//! - Concurrency-bounded import worker pool with pause/resume/cancel
//! - Import UI connection handler with a durable in-progress flag
//!
//! # Example
//!
//! ```rust,ignore
//! use memex_background::{background_config, BackgroundServices, TokenManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = background_config()
//!         .cloud_origin("https://memex.cloud")
//!         .storage_path("/var/lib/memex/background.json")
//!         .build()?;
//!
//!     let services = BackgroundServices::open(config).await?;
//!     let tokens = services.token_manager();
//!
//!     if tokens.is_access_token_expired() {
//!         tokens.refresh_access_token(false).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: token, import and message data structures plus configuration
//! - `error`: error hierarchy
//! - `core`: HTTP transport and key-value storage
//! - `token`: token store and token manager
//! - `imports`: progress flag, import state, worker pool and connection handler
//! - `builders`: fluent configuration builder
//! - `telemetry`: logging setup and metrics
//! - `client`: high-level services facade

pub mod builders;
pub mod client;
pub mod core;
pub mod error;
pub mod imports;
pub mod telemetry;
pub mod token;
pub mod types;

// Re-export main client
pub use client::{BackgroundServices, StoreTokenManager};

// Re-export builders
pub use builders::{background_config, BackgroundConfigBuilder};

// Re-export errors
pub use error::{
    BackgroundError, BackgroundResult, ConfigurationError, ImportError, NetworkError,
    ProtocolError, StorageError, TokenError,
};

// Re-export types
pub use types::{
    // Config
    BackgroundConfig, ImportConfig, TokenManagerConfig,
    // Token
    NewTokens, RefreshOutcome, StoredAccessToken, TokenSet,
    // Import
    AllowTypes, EstimateCounts, ImportItem, ImportOptions, ImportType, ItemResult, ItemStatus,
    // Messages
    ImportCommand, InboundMessage, OutboundMessage,
};

// Re-export core components
pub use crate::core::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, InMemoryKeyValueStore,
    JsonFileKeyValueStore, KeyValueStore, MockHttpTransport, ReqwestHttpTransport,
};

// Re-export token management
pub use token::{DefaultTokenManager, KeyValueTokenStore, MockTokenStore, TokenManager, TokenStore};

// Re-export import coordination
pub use imports::{
    ChannelPort, ChannelProgressObserver, ConnectionState, ImportConnectionHandler,
    ImportItemProcessor, ImportJobState, ImportProgressFlag, ImportServices, ImportStateManager,
    InMemoryImportStateManager, MessagePort, MockItemProcessor, ProgressEvent, ProgressManager,
    ProgressObserver,
};

// Re-export telemetry
pub use telemetry::{BackgroundMetrics, LogFormat, LogLevel, LoggingConfig, MetricsSnapshot};
