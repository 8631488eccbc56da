//! Pipeline errors and their HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::store::StoreError;
use crate::types::EventStatus;

/// Errors surfaced by the processor, replay controller and reaper.
///
/// Per-event delivery failures never appear here; they are recorded on the
/// event itself.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("event not found: {0}")]
    NotFound(Uuid),

    #[error("Event is not in failed state (current status: {status})")]
    InvalidState { id: Uuid, status: EventStatus },

    #[error("webhook processing is disabled by the kill switch")]
    ProcessingDisabled,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("invalid stale threshold: {0}")]
    InvalidThreshold(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// HTTP boundary errors for the admin and ingestion routes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(id) => ApiError::NotFound(format!("event {id} not found")),
            e @ PipelineError::InvalidState { .. } => ApiError::BadRequest(e.to_string()),
            e @ (PipelineError::InvalidBatchSize | PipelineError::InvalidThreshold(_)) => {
                ApiError::BadRequest(e.to_string())
            }
            e @ PipelineError::ProcessingDisabled => ApiError::Unavailable(e.to_string()),
            e @ PipelineError::Configuration(_) => ApiError::Internal(e.to_string()),
            PipelineError::Storage(e) => ApiError::from(e),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("event {id} not found")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let message = match self {
            ApiError::Internal(_) => "An internal error occurred".to_string(),
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Unavailable(msg) => msg,
            other => other.to_string(),
        };

        let body = ErrorBody {
            success: false,
            error: code,
            message,
        };
        (status, Json(body)).into_response()
    }
}
