//! Health check handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Jobs the correlator is tracking (waiting or in grace).
    pub tracked_jobs: usize,
    /// Job tasks still running, including ones whose caller detached.
    pub running_jobs: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "cogbill".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tracked_jobs: state.correlator().len(),
        running_jobs: state.dispatcher.running_jobs(),
    })
}
