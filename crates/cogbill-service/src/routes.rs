//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, credits, health, jobs, webhooks};
use crate::state::AppState;

/// Maximum concurrent ledger requests.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Maximum concurrent blocking job submissions. Each one holds a connection
/// open until its worker answers.
const JOBS_MAX_CONCURRENT_REQUESTS: usize = 200;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Ledger (service API key, request timeout applies)
/// - `GET /v1/users/:user_id/balance` - Spendable balance
/// - `GET /v1/users/:user_id/batches` - Credit batches
/// - `POST /v1/credits/balances` - Several balances from one snapshot
/// - `POST /v1/credits/debit` - Direct debit
/// - `POST /v1/credits/tip` - Tip another user or handle
/// - `POST /v1/accounts/link` - Link a handle, deliver pending tips
/// - `POST /v1/jobs/quote` - Price a job
/// - `GET /v1/jobs/:correlation_id` - Job record
///
/// ## Admin (admin API key)
/// - `POST /v1/credits/grant` - Create a batch
///
/// ## Jobs (service API key, bounded by the per-kind job timeout instead)
/// - `POST /v1/jobs` - Run a job and wait for its outputs
///
/// ## Webhooks (optional signature verification)
/// - `POST /webhooks/cog` - Cog prediction callbacks
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = Duration::from_secs(state.config.request_timeout_seconds);

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let api_routes = Router::new()
        .route("/users/:user_id/balance", get(credits::get_balance))
        .route("/users/:user_id/batches", get(credits::list_batches))
        .route("/credits/balances", post(credits::get_balances))
        .route("/credits/debit", post(credits::debit))
        .route("/credits/tip", post(credits::tip))
        .route("/credits/grant", post(credits::grant))
        .route("/accounts/link", post(accounts::link_account))
        .route("/jobs/quote", post(jobs::quote_job))
        .route("/jobs/:correlation_id", get(jobs::get_job))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS))
        .layer(TimeoutLayer::new(request_timeout));

    let job_routes = Router::new()
        .route("/jobs", post(jobs::submit_job))
        .layer(ConcurrencyLimitLayer::new(JOBS_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no limits)
        .route("/health", get(health::health))
        .nest("/v1", api_routes.merge(job_routes))
        // Webhooks (no concurrency limit - workers retry on failure)
        .route(
            "/webhooks/cog",
            post(webhooks::cog_webhook).layer(TimeoutLayer::new(request_timeout)),
        )
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
