//! Credit balance, debit, tip and grant handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use cogbill_core::{CreditBatch, UserId};
use cogbill_engine::{DebitReceipt, GrantRequest, TipReceipt, TipRecipient};
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::auth::{AdminAuth, ServiceAuth};
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// The user.
    pub user_id: UserId,
    /// Spendable credits right now.
    pub balance: i64,
    /// When the balance was computed.
    pub as_of: DateTime<Utc>,
}

/// Get a user's spendable balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id: UserId = parse_id(&user_id, "user ID")?;
    let as_of = Utc::now();
    let balance = state.ledger().balance(user_id, as_of)?;

    Ok(Json(BalanceResponse {
        user_id,
        balance,
        as_of,
    }))
}

/// One batch as shown to callers.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    /// The batch.
    #[serde(flatten)]
    pub batch: CreditBatch,
    /// Whether the batch counts toward the balance right now.
    pub active: bool,
}

/// Batch list response.
#[derive(Debug, Serialize)]
pub struct ListBatchesResponse {
    /// The user.
    pub user_id: UserId,
    /// Spendable credits right now.
    pub balance: i64,
    /// Every batch the user owns, in consumption order.
    pub batches: Vec<BatchResponse>,
}

/// List a user's credit batches.
pub async fn list_batches(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
) -> Result<Json<ListBatchesResponse>, ApiError> {
    let user_id: UserId = parse_id(&user_id, "user ID")?;
    let now = Utc::now();

    let batches: Vec<_> = state
        .ledger()
        .batches(user_id)?
        .into_iter()
        .map(|batch| BatchResponse {
            active: batch.is_active(now),
            batch,
        })
        .collect();
    let balance = batches
        .iter()
        .filter(|b| b.active)
        .map(|b| b.batch.remaining_amount)
        .sum();

    Ok(Json(ListBatchesResponse {
        user_id,
        balance,
        batches,
    }))
}

/// Debit request body.
#[derive(Debug, Deserialize)]
pub struct DebitRequest {
    /// The user to charge.
    pub user_id: UserId,
    /// Credits to take.
    pub amount: i64,
    /// Free-form note for the log.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Debit credits directly, outside the job pipeline.
pub async fn debit(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(req): Json<DebitRequest>,
) -> Result<Json<DebitReceipt>, ApiError> {
    let receipt = state.ledger().debit(req.user_id, req.amount).await?;

    tracing::info!(
        user_id = %req.user_id,
        amount = req.amount,
        reason = req.reason.as_deref().unwrap_or(""),
        service = %auth.service_name,
        "Debit via API"
    );

    Ok(Json(receipt))
}

/// Tip request body.
#[derive(Debug, Deserialize)]
pub struct TipRequest {
    /// The giver.
    pub from_user_id: UserId,
    /// The recipient, when registered.
    #[serde(default)]
    pub to_user_id: Option<UserId>,
    /// The recipient's external handle.
    #[serde(default)]
    pub to_handle: Option<String>,
    /// Credits to move.
    pub amount: i64,
}

/// Move credits between users.
pub async fn tip(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(req): Json<TipRequest>,
) -> Result<Json<TipReceipt>, ApiError> {
    let recipient = TipRecipient {
        user_id: req.to_user_id,
        handle: req.to_handle.unwrap_or_default(),
    };
    let receipt = state
        .ledger()
        .tip(req.from_user_id, recipient, req.amount)
        .await?;

    Ok(Json(receipt))
}

/// Grant credits (admin only).
pub async fn grant(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    Json(req): Json<GrantRequest>,
) -> Result<Json<CreditBatch>, ApiError> {
    let user_id = req.user_id;
    let amount = req.amount;
    let batch = state.ledger().grant(req).await?;

    tracing::info!(
        admin_id = %auth.admin_id,
        user_id = %user_id,
        amount,
        batch_id = %batch.id,
        "Admin granted credits"
    );

    Ok(Json(batch))
}

/// Multi-user balance request body.
#[derive(Debug, Deserialize)]
pub struct BalancesRequest {
    /// Users to read.
    pub user_ids: Vec<UserId>,
}

/// Multi-user balance response.
#[derive(Debug, Serialize)]
pub struct BalancesResponse {
    /// Balance per user, all read from one snapshot.
    pub balances: std::collections::HashMap<UserId, i64>,
    /// When the balances were computed.
    pub as_of: DateTime<Utc>,
}

/// Read several balances at once.
pub async fn get_balances(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(req): Json<BalancesRequest>,
) -> Result<Json<BalancesResponse>, ApiError> {
    let as_of = Utc::now();
    let balances = state.ledger().balances(&req.user_ids, as_of)?;
    Ok(Json(BalancesResponse { balances, as_of }))
}
