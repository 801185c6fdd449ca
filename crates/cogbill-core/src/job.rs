//! Job and webhook types for cogbill.
//!
//! A job is one unit of work handed to an external cog worker. The worker
//! reports progress through webhooks carrying the job's [`CorrelationId`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BatchDebit, CorrelationId, UserId};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of images a single generation may request.
pub const MAX_OUTPUTS: u32 = 4;

/// Maximum voiceover text length in characters.
pub const MAX_VOICEOVER_CHARS: usize = 1000;

/// Upscale factors the workers support.
pub const SUPPORTED_UPSCALE_FACTORS: [u32; 2] = [2, 4];

/// Kind of job, used for pricing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Text-to-image generation.
    Generation,
    /// Image upscale.
    Upscale,
    /// Text-to-speech voiceover.
    Voiceover,
}

impl JobKind {
    /// Get the job kind name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Upscale => "upscale",
            Self::Voiceover => "voiceover",
        }
    }
}

/// Parameters of a job as requested by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobSpec {
    /// Text-to-image generation.
    Generation {
        /// Prompt text.
        prompt: String,
        /// Number of images to produce.
        num_outputs: u32,
        /// Output width in pixels.
        width: u32,
        /// Output height in pixels.
        height: u32,
        /// Model name, passed through to the worker.
        #[serde(default)]
        model: Option<String>,
    },

    /// Image upscale.
    Upscale {
        /// Source image URL.
        image_url: String,
        /// Upscale factor.
        scale: u32,
    },

    /// Text-to-speech voiceover.
    Voiceover {
        /// Text to speak.
        text: String,
        /// Speaker voice, passed through to the worker.
        #[serde(default)]
        speaker: Option<String>,
    },
}

impl JobSpec {
    /// The kind of this job.
    #[must_use]
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::Generation { .. } => JobKind::Generation,
            Self::Upscale { .. } => JobKind::Upscale,
            Self::Voiceover { .. } => JobKind::Voiceover,
        }
    }

    /// Check that the parameters are acceptable to a worker.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid parameter.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Generation {
                prompt,
                num_outputs,
                width,
                height,
                ..
            } => {
                if prompt.trim().is_empty() {
                    return Err("prompt must not be empty".into());
                }
                if *num_outputs == 0 || *num_outputs > MAX_OUTPUTS {
                    return Err(format!("num_outputs must be between 1 and {MAX_OUTPUTS}"));
                }
                if *width == 0 || *height == 0 {
                    return Err("width and height must be positive".into());
                }
                Ok(())
            }
            Self::Upscale { image_url, scale } => {
                if image_url.trim().is_empty() {
                    return Err("image_url must not be empty".into());
                }
                if !SUPPORTED_UPSCALE_FACTORS.contains(scale) {
                    return Err(format!("unsupported upscale factor {scale}"));
                }
                Ok(())
            }
            Self::Voiceover { text, .. } => {
                if text.trim().is_empty() {
                    return Err("text must not be empty".into());
                }
                if text.chars().count() > MAX_VOICEOVER_CHARS {
                    return Err(format!(
                        "text must be at most {MAX_VOICEOVER_CHARS} characters"
                    ));
                }
                Ok(())
            }
        }
    }

    /// The worker input payload for this job.
    #[must_use]
    pub fn worker_input(&self) -> serde_json::Value {
        match self {
            Self::Generation {
                prompt,
                num_outputs,
                width,
                height,
                model,
            } => serde_json::json!({
                "prompt": prompt,
                "num_outputs": num_outputs,
                "width": width,
                "height": height,
                "model": model,
            }),
            Self::Upscale { image_url, scale } => serde_json::json!({
                "image": image_url,
                "scale": scale,
            }),
            Self::Voiceover { text, speaker } => serde_json::json!({
                "prompt": text,
                "speaker": speaker,
            }),
        }
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Debited and registered, not yet accepted by a worker.
    Pending,
    /// Accepted by a worker.
    Dispatched,
    /// Worker delivered outputs.
    Completed,
    /// Worker reported a failure, or the submission was rejected.
    Failed,
    /// No terminal webhook arrived in time.
    TimedOut,
}

impl JobStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// A job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Correlation ID shared with the worker.
    pub correlation_id: CorrelationId,

    /// The user who paid.
    pub user_id: UserId,

    /// Kind of job.
    pub kind: JobKind,

    /// Price in credits.
    pub cost: i64,

    /// Current status.
    pub status: JobStatus,

    /// Batches debited to pay for the job.
    pub debit: Vec<BatchDebit>,

    /// Outputs delivered by the worker.
    pub outputs: Option<serde_json::Value>,

    /// Failure reason, if any.
    pub failure: Option<String>,

    /// Whether the cost was given back.
    pub refunded: bool,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job was last changed.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job.
    #[must_use]
    pub fn new(
        correlation_id: CorrelationId,
        user_id: UserId,
        kind: JobKind,
        cost: i64,
        debit: Vec<BatchDebit>,
    ) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            user_id,
            kind,
            cost,
            status: JobStatus::Pending,
            debit,
            outputs: None,
            failure: None,
            refunded: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the job to `status`, stamping `updated_at`.
    pub fn transition(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum JobResult {
    /// The worker produced outputs.
    Succeeded {
        /// Opaque outputs (URLs, audio files, ...).
        outputs: serde_json::Value,
    },
    /// The worker gave up.
    Failed {
        /// Reason reported by the worker.
        reason: String,
    },
}

/// Lifecycle events a worker can call back for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    /// Worker picked the job up.
    Start,
    /// Worker produced (partial) output.
    Output,
    /// Worker finished, successfully or not.
    Completed,
}

impl WebhookEventType {
    /// The filter sent with every submission.
    pub const ALL: [Self; 3] = [Self::Start, Self::Output, Self::Completed];
}

/// Prediction status as reported by a cog worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    /// Queued or booting.
    Starting,
    /// Running.
    Processing,
    /// Finished with outputs.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled on the worker side.
    Canceled,
}

impl PredictionStatus {
    /// Whether the prediction has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Body of a cog webhook callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CogPrediction {
    /// The prediction ID, which is the correlation ID we submitted.
    pub id: CorrelationId,

    /// Prediction status.
    pub status: PredictionStatus,

    /// Outputs so far.
    #[serde(default)]
    pub output: Option<serde_json::Value>,

    /// Error message on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// A webhook delivery from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Job the event belongs to.
    pub correlation_id: CorrelationId,

    /// Lifecycle event.
    pub event_type: WebhookEventType,

    /// The raw prediction body.
    pub payload: CogPrediction,
}

impl WebhookEvent {
    /// Classify a prediction callback.
    #[must_use]
    pub fn from_prediction(payload: CogPrediction) -> Self {
        let event_type = match payload.status {
            PredictionStatus::Starting => WebhookEventType::Start,
            PredictionStatus::Processing => WebhookEventType::Output,
            PredictionStatus::Succeeded
            | PredictionStatus::Failed
            | PredictionStatus::Canceled => WebhookEventType::Completed,
        };
        Self {
            correlation_id: payload.id,
            event_type,
            payload,
        }
    }

    /// The job result carried by this event, if it is terminal.
    ///
    /// `completed` events are terminal, and so is an `output` event whose
    /// prediction status is already final.
    #[must_use]
    pub fn terminal_result(&self) -> Option<JobResult> {
        let terminal = match self.event_type {
            WebhookEventType::Start => false,
            WebhookEventType::Output => self.payload.status.is_terminal(),
            WebhookEventType::Completed => true,
        };
        if !terminal {
            return None;
        }

        Some(match self.payload.status {
            PredictionStatus::Succeeded => JobResult::Succeeded {
                outputs: self
                    .payload
                    .output
                    .clone()
                    .unwrap_or(serde_json::Value::Null),
            },
            PredictionStatus::Canceled => JobResult::Failed {
                reason: self
                    .payload
                    .error
                    .clone()
                    .unwrap_or_else(|| "canceled by worker".into()),
            },
            _ => JobResult::Failed {
                reason: self
                    .payload
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker reported failure".into()),
            },
        })
    }
}
