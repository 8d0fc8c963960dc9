//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// All errors that can occur in the broker request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No online worker advertises the requested model.
    #[error("No available client")]
    NoAvailableClient,

    /// The per-request deadline elapsed before the response completed.
    #[error("Chat timeout")]
    ChatTimeout,

    /// The worker's engine reported a failure; the message is passed through.
    #[error("Model error: {0}")]
    ModelError(String),

    /// Missing, malformed, expired, or revoked credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Propagated from the SQLite (or other) store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NoAvailableClient => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::ChatTimeout => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ServerError::ModelError(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ServerError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ServerError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_message_is_stable() {
        // Consumers match on this string; it is part of the HTTP contract.
        assert_eq!(ServerError::NoAvailableClient.to_string(), "No available client");
        assert_eq!(ServerError::ChatTimeout.to_string(), "Chat timeout");
    }
}
