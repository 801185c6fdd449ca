//! Cog worker webhook receiver.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use cogbill_core::{CogPrediction, WebhookEvent};
use cogbill_engine::Resolution;
use serde::Serialize;

use crate::crypto::verify_signature;
use crate::error::ApiError;
use crate::state::AppState;

/// Signature header set by the webhook relay in front of the workers.
pub const SIGNATURE_HEADER: &str = "x-cog-signature";

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was processed.
    pub received: bool,
    /// What happened to a terminal event: `delivered`, `cached` or `duplicate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<&'static str>,
}

const fn resolution_name(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::Delivered => "delivered",
        Resolution::Cached => "cached",
        Resolution::Duplicate => "duplicate",
    }
}

/// Handle cog prediction webhooks.
///
/// Always answers `200` for a well-formed body, duplicates included, so the
/// worker does not keep retrying a delivery we have already seen.
pub async fn cog_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(secret) = &state.config.cog_webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest("Missing webhook signature".into()))?;

        if !verify_signature(secret, &body, signature) {
            tracing::warn!("Invalid cog webhook signature");
            return Err(ApiError::Unauthorized);
        }
    }

    let prediction: CogPrediction =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let event = WebhookEvent::from_prediction(prediction);

    tracing::debug!(
        correlation_id = %event.correlation_id,
        event_type = ?event.event_type,
        status = ?event.payload.status,
        "Received cog webhook"
    );

    let resolution = state.dispatcher.deliver(&event).map(resolution_name);

    Ok(Json(WebhookResponse {
        received: true,
        resolution,
    }))
}
