//! Error taxonomy shared by every HTTP handler and lifecycle operation.
//!
//! Lifecycle and I/O failures surface to the immediate caller as [`AppError`];
//! background job failures never cross the poll boundary as errors, they are
//! captured as [`crate::jobs::JobError`] inside the job record instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Operation not allowed in the current state (start without init, save without a file).
    #[error("{0}")]
    Precondition(String),

    #[error("dependency install failed: {0}")]
    InstallFailure(String),

    #[error("failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("process exited unexpectedly: {0}")]
    ProcessCrashed(String),

    #[error("job failed: {0}")]
    JobExecution(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn precondition<S: Into<String>>(message: S) -> Self {
        Self::Precondition(message.into())
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Stable machine-readable kind, sent alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "precondition",
            Self::InstallFailure(_) => "install_failure",
            Self::ProcessSpawn(_) => "process_spawn_failure",
            Self::ProcessCrashed(_) => "process_crashed",
            Self::JobExecution(_) => "job_execution_error",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Io(_) | Self::Serde(_) | Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Precondition(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::JobExecution(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    kind: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        } else {
            tracing::debug!(kind = self.kind(), "{}", self);
        }
        let body = ErrorBody {
            success: false,
            kind: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
