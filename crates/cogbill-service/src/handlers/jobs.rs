//! Job submission and lookup handlers.
//!
//! `POST /v1/jobs` blocks until the worker reports back or the job's
//! timeout fires. A caller that sets `max_wait_seconds` gets a `202` with
//! the correlation ID when that bound passes first; the job keeps running
//! and its outcome can be fetched with `GET /v1/jobs/{correlation_id}`.
//! A client that disconnects detaches the same way.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use cogbill_core::{CorrelationId, Job, JobKind, JobSpec, UserId};
use cogbill_engine::JobReceipt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::parse_id;
use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Job submission body.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    /// The user paying for the job.
    pub user_id: UserId,
    /// What to run.
    pub spec: JobSpec,
    /// Stop waiting after this many seconds and answer `202`.
    #[serde(default)]
    pub max_wait_seconds: Option<u64>,
}

/// Run a job and wait for its outputs.
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(req): Json<SubmitJobRequest>,
) -> Result<Json<JobReceipt>, ApiError> {
    tracing::debug!(
        user_id = %req.user_id,
        kind = req.spec.kind().as_str(),
        service = %auth.service_name,
        "Job submitted via API"
    );

    let cancel = CancellationToken::new();
    let _deadline = req.max_wait_seconds.map(|secs| {
        let cancel = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            cancel.cancel();
        });
        AbortOnDrop(timer)
    });

    let receipt = state
        .dispatcher
        .submit(req.user_id, req.spec, cancel)
        .await?;
    Ok(Json(receipt))
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Price quote response.
#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    /// Kind of job.
    pub kind: JobKind,
    /// Credits the job would cost.
    pub cost: i64,
}

/// Price a job without running it.
pub async fn quote_job(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(spec): Json<JobSpec>,
) -> Result<Json<QuoteResponse>, ApiError> {
    spec.validate().map_err(ApiError::BadRequest)?;
    Ok(Json(QuoteResponse {
        kind: spec.kind(),
        cost: state.dispatcher.quote(&spec),
    }))
}

/// Look up a job record.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(correlation_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let correlation_id: CorrelationId = parse_id(&correlation_id, "correlation ID")?;
    let job = state
        .dispatcher
        .job(&correlation_id)?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {correlation_id}")))?;
    Ok(Json(job))
}
