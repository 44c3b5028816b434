//! Application error type and wire-level error contract.
//!
//! Every fallible component boundary returns [`AppError`]. Each variant
//! carries a stable machine-readable code and maps to one HTTP status, so
//! the axum boundary can translate any error into the documented body:
//!
//! ```json
//! { "error": { "code": "THREAD_NOT_FOUND", "message": "chat thread not found" } }
//! ```
//!
//! Auth and validation faults are fatal to the request and never retried.
//! Upstream service faults carry the service name for log correlation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AppError>;

/// Domain error for the chat, verification, and knowledge-base pipeline.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed request payload (missing thread id, empty message batch).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Message batch failed structural validation.
    #[error("invalid chat message payload: {0}")]
    InvalidMessages(String),

    /// Thread missing or not visible to the caller. Foreign threads are
    /// reported as not-found, never as forbidden, so existence is not leaked.
    #[error("chat thread not found")]
    ThreadNotFound,

    /// No caller identity could be established.
    #[error("you must be signed in to do this")]
    Unauthorized,

    /// The caller is known but does not own the resource.
    #[error("you do not have permission to access this resource")]
    Forbidden,

    /// Knowledge-base or chat file missing (or foreign, same rule as threads).
    #[error("file not found")]
    FileNotFound,

    /// Upload exceeds the configured size cap.
    #[error("file is too large")]
    FileTooLarge,

    /// Upload content type outside the allowlist (PDF or image/*).
    #[error("unsupported file type; upload a PDF or image")]
    UnsupportedContentType,

    /// A collaborator service (generation model, embedding model, segmenter)
    /// failed or returned garbage.
    #[error("{service} error: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    /// SQLite failure.
    #[error("database error: {0}")]
    Database(String),

    /// Invalid or inconsistent configuration detected at runtime
    /// (e.g. embedding dimensionality mismatch).
    #[error("configuration error: {0}")]
    Config(String),

    /// Everything else.
    #[error("something went wrong: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable wire-level error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidMessages(_) => "INVALID_MESSAGES",
            Self::ThreadNotFound => "THREAD_NOT_FOUND",
            Self::Unauthorized => "AUTH_UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::UnsupportedContentType => "UNSUPPORTED_CONTENT_TYPE",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status this error surfaces as at the request boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidMessages(_)
            | Self::FileTooLarge
            | Self::UnsupportedContentType => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ThreadNotFound | Self::FileNotFound => StatusCode::NOT_FOUND,
            Self::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Config(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Construct an internal error from any displayable cause.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Construct an external-service error tagged with the service name.
    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}

// ============ Wire representation ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "request failed: {self}");
        } else {
            tracing::warn!(code = self.code(), "request rejected: {self}");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
