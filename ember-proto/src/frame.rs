//! The frame envelope and keepalive payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Model;

/// Discriminant of a [`Frame`], serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Ping or pong; `content` is a [`PingPong`].
    Keepalive,
    /// Worker → broker, first frame on the control channel; `content` is a
    /// [`crate::model::RegisterInfo`].
    Register,
    /// A complete (unary) model response, or broker → worker dispatch of a
    /// chat request.
    Message,
    /// One streamed chunk of a model response.
    #[serde(rename = "stream")]
    MessageStream,
    /// Broker → worker dispatch of an embedding request.
    EmbeddingRequest,
    /// Worker → broker embedding result.
    EmbeddingResponse,
    /// Worker-side engine failure; `content` is a human-readable string.
    ModelError,
    /// Either side is done with the channel.
    Close,
    /// Broker → worker: replace the stored join token with `content`.
    Reconnect,
    /// Broker → worker revenue notification; `content` is an
    /// [`crate::model::IncomeNotice`].
    Income,
    /// Anything this build does not understand; logged and dropped.
    #[serde(other)]
    Unknown,
}

/// The JSON envelope carried on both WebSocket channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Frame {
    pub fn new(kind: FrameKind, content: Value) -> Self {
        Self { kind, content, fingerprint: None }
    }

    pub fn with_fingerprint(kind: FrameKind, content: Value, fingerprint: impl Into<String>) -> Self {
        Self { kind, content, fingerprint: Some(fingerprint.into()) }
    }

    /// A `CLOSE` frame for the given fingerprint (or the control channel
    /// itself when `fingerprint` is `None`).
    pub fn close(fingerprint: Option<String>) -> Self {
        Self { kind: FrameKind::Close, content: Value::Null, fingerprint }
    }

    /// A `MODEL_ERROR` frame carrying `message`.
    pub fn model_error(message: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::ModelError,
            content: Value::String(message.into()),
            fingerprint: Some(fingerprint.into()),
        }
    }

    /// Deserialize `content` into a typed payload.
    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.content.clone())
    }
}

/// Direction of a [`PingPong`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingPongKind {
    Ping,
    Pong,
}

/// Content of a `KEEPALIVE` frame.
///
/// The broker sends a ping stamped with its clock in milliseconds; the worker
/// echoes the timestamp back in the pong together with a refreshed model
/// list, so a single round trip both measures latency and re-advertises
/// capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPong {
    #[serde(rename = "type")]
    pub kind: PingPongKind,
    /// Milliseconds since the Unix epoch, as stamped by the pinging side.
    pub timestamp: i64,
    /// Refreshed advertisement; meaningful on pongs only.
    #[serde(rename = "update_model", default, skip_serializing_if = "Vec::is_empty")]
    pub available_models: Vec<Model>,
}

impl PingPong {
    pub fn ping(timestamp: i64) -> Self {
        Self { kind: PingPongKind::Ping, timestamp, available_models: Vec::new() }
    }

    pub fn pong(timestamp: i64, available_models: Vec<Model>) -> Self {
        Self { kind: PingPongKind::Pong, timestamp, available_models }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_wire_names() {
        // MESSAGE_STREAM rides the wire as "stream"; everything else is the
        // snake_case of the variant name.
        let json = serde_json::to_string(&FrameKind::MessageStream).unwrap();
        assert_eq!(json, "\"stream\"");
        let json = serde_json::to_string(&FrameKind::EmbeddingRequest).unwrap();
        assert_eq!(json, "\"embedding_request\"");
    }

    #[test]
    fn unknown_kinds_do_not_fail_deserialization() {
        let frame: Frame =
            serde_json::from_str(r#"{"type":"telemetry","content":{"x":1}}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown);
    }

    #[test]
    fn envelope_field_names() {
        let frame = Frame::with_fingerprint(
            FrameKind::Message,
            serde_json::json!({"model": "qwen3:0.6b"}),
            "fp-1",
        );
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["fingerprint"], "fp-1");
        assert_eq!(v["content"]["model"], "qwen3:0.6b");
    }

    #[test]
    fn pong_echoes_timestamp() {
        let ping = PingPong::ping(1_700_000_000_123);
        let pong = PingPong::pong(ping.timestamp, Vec::new());
        assert_eq!(pong.timestamp, ping.timestamp);
        assert_eq!(pong.kind, PingPongKind::Pong);
    }
}
