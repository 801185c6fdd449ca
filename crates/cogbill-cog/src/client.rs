//! Cog HTTP client implementation.

use std::time::Duration;

use async_trait::async_trait;
use cogbill_core::{CorrelationId, JobKind, WebhookEventType};
use cogbill_engine::{CogRequest, CogWorker, SubmitError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::CogError;

/// Longest response body kept in a [`CogError::Rejected`].
const MAX_ERROR_BODY: usize = 512;

/// Base URLs of the cog servers, one per job kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CogEndpoints {
    /// Image generation server.
    pub generation: String,
    /// Upscale server.
    pub upscale: String,
    /// Voiceover server.
    pub voiceover: String,
}

impl CogEndpoints {
    /// One server for every kind.
    #[must_use]
    pub fn single(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            generation: base_url.clone(),
            upscale: base_url.clone(),
            voiceover: base_url,
        }
    }

    fn for_kind(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Generation => &self.generation,
            JobKind::Upscale => &self.upscale,
            JobKind::Voiceover => &self.voiceover,
        }
    }
}

/// Options for the cog client.
#[derive(Debug, Clone)]
pub struct CogClientOptions {
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// Bearer token sent to the worker, if it requires one.
    pub bearer_token: Option<String>,
}

impl Default for CogClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            bearer_token: None,
        }
    }
}

/// Body of an asynchronous prediction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// Prediction ID (the correlation ID).
    pub id: CorrelationId,
    /// Model input.
    pub input: serde_json::Value,
    /// Webhook URL.
    pub webhook: String,
    /// Events to call back for.
    pub webhook_events_filter: Vec<WebhookEventType>,
}

impl From<CogRequest> for PredictionRequest {
    fn from(request: CogRequest) -> Self {
        Self {
            id: request.id,
            input: request.input,
            webhook: request.webhook,
            webhook_events_filter: request.webhook_events_filter,
        }
    }
}

/// HTTP client for cog prediction servers.
#[derive(Debug, Clone)]
pub struct HttpCogWorker {
    client: Client,
    endpoints: CogEndpoints,
    bearer_token: Option<String>,
}

impl HttpCogWorker {
    /// Create a client with default options.
    ///
    /// # Errors
    ///
    /// Returns `CogError::Configuration` if the HTTP client cannot be built.
    pub fn new(endpoints: CogEndpoints) -> Result<Self, CogError> {
        Self::with_options(endpoints, CogClientOptions::default())
    }

    /// Create a client with custom options.
    ///
    /// # Errors
    ///
    /// Returns `CogError::Configuration` if the HTTP client cannot be built.
    pub fn with_options(
        endpoints: CogEndpoints,
        options: CogClientOptions,
    ) -> Result<Self, CogError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| CogError::Configuration(e.to_string()))?;

        let trim = |url: String| url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            endpoints: CogEndpoints {
                generation: trim(endpoints.generation),
                upscale: trim(endpoints.upscale),
                voiceover: trim(endpoints.voiceover),
            },
            bearer_token: options.bearer_token,
        })
    }

    /// Start an asynchronous prediction.
    ///
    /// A `409 Conflict` means the worker already has a prediction with this
    /// ID, which happens when a submission is retried; it counts as accepted.
    ///
    /// # Errors
    ///
    /// - `CogError::Http` if the worker could not be reached or did not
    ///   answer in time; see [`CogError::outcome_unknown`].
    /// - `CogError::Rejected` for any other non-success status.
    pub async fn create_prediction(
        &self,
        kind: JobKind,
        request: &PredictionRequest,
    ) -> Result<(), CogError> {
        let url = format!("{}/predictions/{}", self.endpoints.for_kind(kind), request.id);

        let mut builder = self
            .client
            .put(&url)
            .header("prefer", "respond-async")
            .json(request);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            tracing::debug!(
                correlation_id = %request.id,
                kind = kind.as_str(),
                status = status.as_u16(),
                "Prediction accepted"
            );
            return Ok(());
        }
        if status == StatusCode::CONFLICT {
            tracing::debug!(correlation_id = %request.id, "Prediction already exists");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        Err(CogError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CogWorker for HttpCogWorker {
    async fn submit(&self, request: CogRequest) -> Result<(), SubmitError> {
        let kind = request.kind;
        let prediction = PredictionRequest::from(request);
        self.create_prediction(kind, &prediction)
            .await
            .map_err(SubmitError::from)
    }
}
