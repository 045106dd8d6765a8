//! Error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Service-level error. Transient external failures are handled at their
/// call sites and never surface here; these are the kinds that change
/// control flow.
#[derive(Debug)]
pub enum MedicError {
    /// Configuration missing, unreadable, or violating a startup invariant.
    /// The process exits with code 2.
    Config(String),
    /// Outcome store unreachable or schema mismatch. The process exits with
    /// code 3.
    Store(String),
    /// Stream broker failure that outlived the listener's own retries.
    Stream(String),
    /// Container runtime failure.
    Runtime(String),
}

impl std::fmt::Display for MedicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Store(msg) => write!(f, "outcome store error: {msg}"),
            Self::Stream(msg) => write!(f, "stream error: {msg}"),
            Self::Runtime(msg) => write!(f, "container runtime error: {msg}"),
        }
    }
}

impl std::error::Error for MedicError {}

impl From<sqlx::Error> for MedicError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP surface errors. Internals are logged, never returned to clients.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    StoreUnavailable,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.as_str()),
            ApiError::StoreUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "Outcome store unavailable")
            }
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(format!("database error: {err}"))
    }
}
