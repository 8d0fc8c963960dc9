//! Worker-side error types.

use thiserror::Error;

/// Failures inside an engine adapter; surfaced to the broker as a
/// `MODEL_ERROR` frame.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engine returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("no engine supports model: {0}")]
    UnsupportedModel(String),

    #[error("operation not supported by the {0} engine")]
    UnsupportedOperation(&'static str),

    #[error("malformed engine payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Failures on the broker link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("frame encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker closed the connection")]
    Closed,
}
