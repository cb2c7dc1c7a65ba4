use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_provider::ProviderError;
use relay_store::StoreError;
use serde_json::json;
use thiserror::Error;

use crate::graph::EngineError;

/// Caller-visible failure of a runner operation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Validation(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("checkpoint store: {0}")]
    Persistence(String),

    #[error("{0}")]
    Internal(String),

    #[error("runner is closed")]
    Closed,
}

impl RunnerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Persistence(_) | Self::Internal(_) | Self::Closed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Upstream { body, .. } if !body.is_empty() => body.clone(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for RunnerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => Self::Closed,
            err if err.is_invalid_input() => Self::Validation(err.to_string()),
            err => Self::Persistence(err.to_string()),
        }
    }
}

impl From<ProviderError> for RunnerError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Http { status, body } => Self::Upstream { status, body },
            ProviderError::Closed => Self::Closed,
            err => Self::Internal(err.to_string()),
        }
    }
}

impl From<EngineError> for RunnerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(err) => err.into(),
            EngineError::Provider(err) => err.into(),
            EngineError::InvalidInput(message) => Self::Validation(message),
            err @ EngineError::StepLimit(_) => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}
