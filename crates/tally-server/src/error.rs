//! Error types for the tally server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tally_core::CoreError;
use thiserror::Error;

/// Errors that can occur in the tally server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed body, bad hash or bad ciphertext.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Caller IP is outside the trusted subnet.
    #[error("untrusted source: {0}")]
    Untrusted(String),

    /// No metric of this kind under this name.
    #[error("{kind} metric not found: {name}")]
    NotFound {
        /// Kind that was looked up.
        kind: String,
        /// The missing name.
        name: String,
    },

    /// Metric type is neither `gauge` nor `counter`.
    #[error("unsupported metric type: {0}")]
    UnsupportedKind(String),

    /// A backend the request depends on is not available.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Snapshot could not be written or read.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to bind to the listen address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(String, std::io::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MetricNotFound { kind, name } => Self::NotFound {
                kind: kind.to_string(),
                name,
            },
            CoreError::UnsupportedKind { kind } => Self::UnsupportedKind(kind),
            CoreError::Key { .. } => Self::Config(err.to_string()),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ServerError {
    /// Returns the HTTP status and short error type for this error.
    #[must_use]
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Untrusted(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Self::UnsupportedKind(_) => (StatusCode::NOT_IMPLEMENTED, "unsupported_kind"),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            Self::Persistence(_)
            | Self::Database(_)
            | Self::Config(_)
            | Self::BindFailed(_, _)
            | Self::Io(_)
            | Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}
