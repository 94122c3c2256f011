use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::{sandbox::SandboxError, store::StoreError};

/// Errors surfaced by the intake API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("queue is full")]
    QueueFull,
    #[error("submission not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::NotFound => StatusCode::NOT_FOUND,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) => Self::NotFound,
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Errors raised while judging one submission.
///
/// `Backend` and `Timeout` are per-case and are folded into case outcomes by
/// the runner. `Config` and `Compilation` end the run early. Everything that
/// reaches the orchestrator other than `Compilation` becomes `InternalError`.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Compilation(String),
    #[error("sandbox backend error: {0}")]
    Backend(String),
    #[error("execution exceeded {0} ms")]
    Timeout(u64),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SandboxError> for JudgeError {
    fn from(value: SandboxError) -> Self {
        match value {
            SandboxError::Compilation(diagnostic) => Self::Compilation(diagnostic),
            SandboxError::Timeout(ms) => Self::Timeout(ms),
            SandboxError::Other(err) => Self::Backend(format!("{err:#}")),
        }
    }
}
