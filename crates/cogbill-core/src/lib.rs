//! Core types and utilities for cogbill.
//!
//! This crate provides the foundational types shared by the ledger, the job
//! dispatcher, and the HTTP service:
//!
//! - **Identifiers**: `UserId`, `BatchId`, `PendingTipId`, `CorrelationId`
//! - **Credits**: `CreditBatch`, `CreditType`, `PendingTip`, `BatchDebit`
//! - **Jobs**: `JobSpec`, `Job`, `JobStatus`, `JobResult`, `WebhookEvent`
//! - **Pricing**: `PricingConfig`
//!
//! # Credits
//!
//! Credits are whole units stored as `i64`. A user's spendable balance is the
//! sum of the remaining amounts of their unexpired batches; there is no
//! stored balance column to drift out of sync.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod credits;
pub mod error;
pub mod ids;
pub mod job;
pub mod pricing;

pub use credits::{
    consumption_order, never_expires, plan_debit, spendable_balance, BatchDebit, CreditBatch,
    CreditType, PendingTip, Period, NEVER_EXPIRES_UNIX,
};
pub use error::{BillingError, Result};
pub use ids::{BatchId, CorrelationId, IdError, PendingTipId, UserId};
pub use job::{
    CogPrediction, Job, JobKind, JobResult, JobSpec, JobStatus, PredictionStatus, WebhookEvent,
    WebhookEventType, MAX_OUTPUTS, MAX_VOICEOVER_CHARS, SUPPORTED_UPSCALE_FACTORS,
};
pub use pricing::{PricingConfig, BASE_PIXEL_AREA};
