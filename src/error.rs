//! Errors the pipeline needs to tell apart.
//!
//! Application seams use `anyhow`; the variants here are the ones that are
//! attached to a [`TransformContext`](crate::models::TransformContext),
//! recorded as a pipeline's cancellation cause, or matched on by callers.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// A stage body failed (external call error, unexpected response shape, I/O).
    #[error("{stage}: {message}")]
    Stage { stage: String, message: String },

    /// No configured bundle maps the document's origin folder.
    #[error("no bundle mapping found for folder '{folder_id}'")]
    BundleNotFound { folder_id: String },

    /// The conversion service reported that the job failed.
    #[error("conversion job {job_id} failed: {reason}")]
    ConversionFailed { job_id: String, reason: String },

    /// The conversion job did not finish before the polling deadline.
    #[error("conversion job {job_id} did not finish within {timeout_secs}s")]
    ConversionTimeout { job_id: String, timeout_secs: u64 },

    /// The watcher could not provide a readable stream for the document.
    #[error("source document unavailable: {0}")]
    SourceUnavailable(String),

    /// Too many systemic failures inside the supervision window.
    #[error("{failures} stage failures within {window_secs}s, last: {last}")]
    FailureThresholdExceeded {
        failures: usize,
        window_secs: u64,
        last: String,
    },
}

impl PipelineError {
    /// Builds a stage error from any error, keeping `PipelineError`s intact.
    pub fn from_stage(stage: &str, err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(pe) => pe,
            Err(other) => PipelineError::Stage {
                stage: stage.to_string(),
                message: format!("{:#}", other),
            },
        }
    }

    /// Whether the failure points at the environment (quota, outage) rather
    /// than at the document's own data.
    pub fn is_systemic(&self) -> bool {
        !matches!(self, PipelineError::BundleNotFound { .. })
    }
}
