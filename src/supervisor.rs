//! Pipeline-wide cancellation scope and the failure-rate supervisor.
//!
//! A [`CancelScope`] is shared by every task a pipeline spawns. Cancelling it
//! optionally records a cause, and the first recorded cause wins.
//!
//! The [`FailureSupervisor`] counts systemic document failures in a sliding
//! window and cancels the scope once the configured threshold is reached.
//! Mapping failures ([`PipelineError::is_systemic`] false) are ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::PipelineError;

#[derive(Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    cause: Arc<OnceLock<PipelineError>>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels without a cause (orderly shutdown).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Records `cause` unless one is already set, then cancels.
    pub fn cancel_with(&self, cause: PipelineError) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn cause(&self) -> Option<PipelineError> {
        self.cause.get().cloned()
    }
}

pub struct FailureSupervisor {
    threshold: usize,
    window: Duration,
    failures: Mutex<VecDeque<Instant>>,
    scope: CancelScope,
}

impl FailureSupervisor {
    pub fn new(threshold: usize, window: Duration, scope: CancelScope) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            failures: Mutex::new(VecDeque::new()),
            scope,
        }
    }

    /// Records a document failure. Returns `true` if this failure tripped
    /// the threshold and cancelled the pipeline.
    pub fn record(&self, err: &PipelineError) -> bool {
        if !err.is_systemic() {
            return false;
        }

        let now = Instant::now();
        let count = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            failures.push_back(now);
            while let Some(oldest) = failures.front() {
                if now.duration_since(*oldest) > self.window {
                    failures.pop_front();
                } else {
                    break;
                }
            }
            failures.len()
        };

        if count < self.threshold || self.scope.is_cancelled() {
            return false;
        }

        error!(
            failures = count,
            window_secs = self.window.as_secs(),
            "failure threshold reached, cancelling pipeline"
        );
        self.scope.cancel_with(PipelineError::FailureThresholdExceeded {
            failures: count,
            window_secs: self.window.as_secs(),
            last: err.to_string(),
        });
        true
    }

    /// Systemic failures currently inside the window.
    pub fn recent_failures(&self) -> usize {
        let now = Instant::now();
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures
            .iter()
            .filter(|at| now.duration_since(**at) <= self.window)
            .count()
    }
}
