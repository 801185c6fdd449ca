//! Cogbill HTTP API Service.
//!
//! This crate exposes the credit ledger and the job dispatcher over HTTP:
//!
//! - Balances and batch listings
//! - Direct debits, tips, and handle linking
//! - Blocking job submission and job lookup
//! - Admin grants
//! - The webhook receiver cog workers call back into
//!
//! # Authentication
//!
//! 1. **Service API key** (`x-api-key`) - for the chat bot and web frontend
//! 2. **Admin API key** (`x-admin-key`) - for grants
//! 3. **Webhook signature** (`x-cog-signature`) - when a secret is configured

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers must be async for Axum

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
