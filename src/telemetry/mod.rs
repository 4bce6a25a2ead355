//! Telemetry
//!
//! Logging setup and metrics for the background services.

pub mod logging;
pub mod metrics;

pub use logging::{log_error, LogFormat, LogLevel, LoggingConfig};
pub use metrics::{BackgroundMetrics, MetricsSnapshot};
