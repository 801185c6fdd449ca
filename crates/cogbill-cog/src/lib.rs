//! Cog worker client for cogbill.
//!
//! Submits jobs to cog prediction servers with the asynchronous prediction
//! API: `PUT /predictions/{id}` with `Prefer: respond-async`, a webhook URL
//! and the lifecycle events to call back for. The prediction ID is the job's
//! correlation ID, so every webhook the worker sends can be matched back to
//! the waiting job.
//!
//! # Example
//!
//! ```no_run
//! use cogbill_cog::{CogEndpoints, HttpCogWorker};
//!
//! # fn example() -> Result<(), cogbill_cog::CogError> {
//! let worker = HttpCogWorker::new(CogEndpoints::single("http://cog-sdxl:5000"))?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;

pub use client::{CogClientOptions, CogEndpoints, HttpCogWorker, PredictionRequest};
pub use error::CogError;
