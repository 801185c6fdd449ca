//! Application state.

use cogbill_engine::{Dispatcher, JobCorrelator, Ledger};

use crate::config::ServiceConfig;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The job dispatch pipeline. Owns the ledger and the correlator.
    pub dispatcher: Dispatcher,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(dispatcher: Dispatcher, config: ServiceConfig) -> Self {
        if config.service_api_key.is_none() {
            tracing::warn!("SERVICE_API_KEY not configured - API routes will reject every request");
        }
        if config.admin_api_key.is_none() {
            tracing::warn!("ADMIN_API_KEY not configured - grants are disabled");
        }
        if config.cog_webhook_secret.is_none() {
            tracing::warn!(
                "COG_WEBHOOK_SECRET not configured - webhook signatures will not be checked"
            );
        }

        Self { dispatcher, config }
    }

    /// The credit ledger.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        self.dispatcher.ledger()
    }

    /// The job correlator.
    #[must_use]
    pub fn correlator(&self) -> &JobCorrelator {
        self.dispatcher.correlator()
    }
}
