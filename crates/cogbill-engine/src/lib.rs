//! Credit ledger and job dispatch engine for cogbill.
//!
//! This crate turns a synchronous "generate this for me" request into an
//! asynchronous job run by a remote cog worker, and prices and debits it
//! against a per-user ledger of expiring credit batches.
//!
//! # Components
//!
//! - [`Ledger`]: balances, soonest-expiring-first debits, tips, refunds,
//!   grants and account linking, all on top of a [`cogbill_store::LedgerStore`].
//! - [`JobCorrelator`]: the bridge between an outbound submission and the
//!   webhook that eventually reports its result.
//! - [`Dispatcher`]: price, debit, submit, wait, finalize.
//! - [`CogWorker`]: the seam to whatever actually runs the job.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod correlator;
pub mod dispatch;
pub mod ledger;
pub mod worker;

pub use correlator::{CorrelatorError, EntryState, JobCorrelator, Resolution, WaitError, Waiter};
pub use dispatch::{
    DispatchError, DispatchOptions, Dispatcher, JobReceipt, JobTimeouts, RefundPolicy,
};
pub use ledger::{
    DebitReceipt, GrantRequest, Ledger, LedgerOptions, LinkReceipt, TipDelivery, TipReceipt,
    TipRecipient,
};
pub use worker::{CogRequest, CogWorker, SubmitError};
