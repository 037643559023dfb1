//! Retry lifecycle observers.
//!
//! The coordinator reports every attempt decision to an injected observer
//! instead of logging directly.

use axum::http::StatusCode;

use crate::observability::metrics;

/// Receives attempt lifecycle events from the coordinator.
pub trait RetryObserver: Send + Sync {
    fn attempt_started(&self, _attempt: u32, _max_attempts: u32) {}

    /// The attempt's output was swallowed and another attempt follows.
    fn attempt_discarded(&self, _attempt: u32, _status: Option<StatusCode>) {}

    /// The attempt's output was delivered. `status` is `None` when the
    /// handler wrote through without interception.
    fn settled(&self, _attempt: u32, _status: Option<StatusCode>) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RetryObserver for NoopObserver {}

/// Emits `tracing` events and records metrics, labelled by middleware name.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    name: String,
}

impl TracingObserver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new("retry")
    }
}

impl RetryObserver for TracingObserver {
    fn attempt_started(&self, attempt: u32, max_attempts: u32) {
        tracing::trace!(middleware = %self.name, attempt, max_attempts, "Attempt started");
    }

    fn attempt_discarded(&self, attempt: u32, status: Option<StatusCode>) {
        tracing::info!(
            middleware = %self.name,
            attempt,
            status = ?status.map(|s| s.as_u16()),
            "Retryable status received, retrying"
        );
        metrics::record_attempt(&self.name, "discarded");
    }

    fn settled(&self, attempt: u32, status: Option<StatusCode>) {
        let code = status.map(|s| s.as_u16());
        if attempt > 1 {
            tracing::info!(middleware = %self.name, attempt, status = ?code, "Request settled after retries");
        } else {
            tracing::debug!(middleware = %self.name, status = ?code, "Request settled on first attempt");
        }
        metrics::record_attempt(&self.name, "settled");
        metrics::record_settled(&self.name, code, attempt);
    }
}
