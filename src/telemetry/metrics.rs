//! Background Metrics
//!
//! Lock-free counters for token refreshes and import runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Background services metrics collector.
#[derive(Debug, Default)]
pub struct BackgroundMetrics {
    /// Successful access token refreshes.
    pub token_refreshes: AtomicU64,
    /// Refresh attempts answered without a usable token.
    pub refresh_failures: AtomicU64,
    /// Import items processed successfully.
    pub items_succeeded: AtomicU64,
    /// Import items that failed processing.
    pub items_failed: AtomicU64,
    /// Import runs that exhausted their supply.
    pub runs_completed: AtomicU64,
    /// Inbound commands that could not be decoded.
    pub unknown_commands: AtomicU64,
}

impl BackgroundMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_token_refresh(&self) {
        self.token_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome of one import item.
    pub fn record_item(&self, success: bool) {
        if success {
            self.items_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.items_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_command(&self) {
        self.unknown_commands.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            token_refreshes: self.token_refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            items_succeeded: self.items_succeeded.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            unknown_commands: self.unknown_commands.load(Ordering::Relaxed),
        }
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        self.token_refreshes.store(0, Ordering::Relaxed);
        self.refresh_failures.store(0, Ordering::Relaxed);
        self.items_succeeded.store(0, Ordering::Relaxed);
        self.items_failed.store(0, Ordering::Relaxed);
        self.runs_completed.store(0, Ordering::Relaxed);
        self.unknown_commands.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub token_refreshes: u64,
    pub refresh_failures: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub runs_completed: u64,
    pub unknown_commands: u64,
}

impl MetricsSnapshot {
    /// Total import items processed.
    pub fn items_processed(&self) -> u64 {
        self.items_succeeded + self.items_failed
    }

    /// Returns the import item success rate.
    pub fn item_success_rate(&self) -> f64 {
        let total = self.items_processed();
        if total == 0 {
            1.0
        } else {
            self.items_succeeded as f64 / total as f64
        }
    }
}
