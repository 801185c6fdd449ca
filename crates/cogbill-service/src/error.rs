//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cogbill_core::{BillingError, CorrelationId};
use cogbill_engine::DispatchError;
use serde::Serialize;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - e.g. a handle linked to someone else.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Insufficient credits.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// The worker did not accept the job, or reported a failure.
    #[error("{message}")]
    JobFailed {
        /// Machine-readable code (`submission_failed` or `job_failed`).
        code: &'static str,
        /// Human-readable message.
        message: String,
        /// The job.
        correlation_id: CorrelationId,
        /// Whether the cost was refunded.
        refunded: bool,
    },

    /// No result arrived before the job's timeout.
    #[error("job {correlation_id} timed out")]
    JobTimedOut {
        /// The job.
        correlation_id: CorrelationId,
        /// Whether the cost was refunded.
        refunded: bool,
    },

    /// The caller stopped waiting; the job is still running.
    #[error("job {correlation_id} is still running")]
    JobDetached {
        /// The job, for `GET /v1/jobs/{correlation_id}`.
        correlation_id: CorrelationId,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientCredits { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "required": required
                })),
            ),
            Self::JobFailed {
                code,
                message,
                correlation_id,
                refunded,
            } => (
                StatusCode::BAD_GATEWAY,
                *code,
                message.clone(),
                Some(serde_json::json!({
                    "correlation_id": correlation_id,
                    "refunded": refunded
                })),
            ),
            Self::JobTimedOut {
                correlation_id,
                refunded,
            } => (
                StatusCode::GATEWAY_TIMEOUT,
                "job_timed_out",
                self.to_string(),
                Some(serde_json::json!({
                    "correlation_id": correlation_id,
                    "refunded": refunded
                })),
            ),
            Self::JobDetached { correlation_id } => (
                StatusCode::ACCEPTED,
                "job_detached",
                self.to_string(),
                Some(serde_json::json!({ "correlation_id": correlation_id })),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            BillingError::HandleAlreadyLinked { .. } => Self::Conflict(err.to_string()),
            BillingError::InvalidAmount(_)
            | BillingError::InvalidBatch(_)
            | BillingError::SelfTip
            | BillingError::InvalidRecipient(_)
            | BillingError::InvalidId(_) => Self::BadRequest(err.to_string()),
            BillingError::StorageTransaction(msg) => Self::Internal(msg),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            DispatchError::InvalidJob(msg) => Self::BadRequest(msg),
            DispatchError::SubmissionFailed {
                correlation_id,
                refunded,
                ..
            } => Self::JobFailed {
                code: "submission_failed",
                message: err.to_string(),
                correlation_id,
                refunded,
            },
            DispatchError::Failed {
                correlation_id,
                refunded,
                ..
            } => Self::JobFailed {
                code: "job_failed",
                message: err.to_string(),
                correlation_id,
                refunded,
            },
            DispatchError::TimedOut {
                correlation_id,
                refunded,
                ..
            } => Self::JobTimedOut {
                correlation_id,
                refunded,
            },
            DispatchError::Detached { correlation_id } => Self::JobDetached { correlation_id },
            DispatchError::Storage(msg) | DispatchError::Internal(msg) => Self::Internal(msg),
            DispatchError::Correlation(e) => Self::Internal(e.to_string()),
        }
    }
}
