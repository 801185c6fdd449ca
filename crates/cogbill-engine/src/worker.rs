//! The seam to whatever runs a job.

use async_trait::async_trait;
use cogbill_core::{CorrelationId, JobKind, WebhookEventType};
use serde::{Deserialize, Serialize};

/// A job submission to a cog worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CogRequest {
    /// Correlation ID; the worker echoes it back in every webhook.
    pub id: CorrelationId,

    /// Kind of job, used to pick the worker.
    pub kind: JobKind,

    /// Model input.
    pub input: serde_json::Value,

    /// URL the worker calls back.
    pub webhook: String,

    /// Lifecycle events the worker should call back for.
    pub webhook_events_filter: Vec<WebhookEventType>,
}

/// A submission that did not end in an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The worker definitely did not take the job.
    #[error("worker rejected submission: {0}")]
    Rejected(String),

    /// The request may have reached the worker, but no answer came back.
    /// The job could still be running and report through the webhook.
    #[error("worker submission outcome unknown: {0}")]
    Unknown(String),
}

/// Something that accepts jobs and reports back by webhook.
#[async_trait]
pub trait CogWorker: Send + Sync {
    /// Hand `request` to the worker.
    ///
    /// Returns once the worker has accepted the job; the result arrives
    /// later through the webhook.
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Rejected` if the worker refused or could not be
    /// reached, and `SubmitError::Unknown` if the request went out but the
    /// acknowledgement was lost.
    async fn submit(&self, request: CogRequest) -> Result<(), SubmitError>;
}
