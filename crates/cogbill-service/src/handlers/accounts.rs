//! Account linking handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use cogbill_core::UserId;
use cogbill_engine::LinkReceipt;
use serde::Deserialize;

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Link request body.
#[derive(Debug, Deserialize)]
pub struct LinkAccountRequest {
    /// External handle (chat username).
    pub handle: String,
    /// The registered user claiming it.
    pub user_id: UserId,
}

/// Link an external handle to a user and deliver its pending tips.
pub async fn link_account(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(req): Json<LinkAccountRequest>,
) -> Result<Json<LinkReceipt>, ApiError> {
    let receipt = state.ledger().link_account(&req.handle, req.user_id).await?;
    Ok(Json(receipt))
}
