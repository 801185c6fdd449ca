//! Cog client error types.

/// Errors that can occur when talking to a cog worker.
#[derive(Debug, thiserror::Error)]
pub enum CogError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The worker answered with a non-success status.
    #[error("worker rejected prediction: HTTP {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CogError {
    /// Whether the worker may have received the prediction anyway.
    ///
    /// Only a transport failure after the connection was made qualifies: a
    /// read timeout or a dropped response leaves the prediction running
    /// remotely with no acknowledgement.
    #[must_use]
    pub fn outcome_unknown(&self) -> bool {
        match self {
            Self::Http(e) => !(e.is_connect() || e.is_builder()),
            Self::Rejected { .. } | Self::Configuration(_) => false,
        }
    }
}

impl From<CogError> for cogbill_engine::SubmitError {
    fn from(err: CogError) -> Self {
        if err.outcome_unknown() {
            Self::Unknown(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}
