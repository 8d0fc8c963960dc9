//! OpenAI-compatible API v1 request / response types.
//!
//! Kept intentionally compatible with the OpenAI REST specification so
//! existing SDK clients work without modification.  Requests are parsed into
//! these types for validation and routing, then re-serialized for the worker
//! — unknown fields survive the trip through the `extra` flatten maps.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ── Chat Completions ─────────────────────────────────────────────────────────

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    /// The role of the message author (`"system"`, `"user"`, `"assistant"`).
    pub role: String,
    /// Message content; a string, or an array of content parts.
    #[schema(value_type = Object)]
    pub content: serde_json::Value,
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    /// The model identifier to dispatch on.
    pub model: String,
    /// Conversation history.
    pub messages: Vec<ChatMessage>,
    /// When `true`, the response is streamed as SSE.
    #[serde(default)]
    pub stream: bool,
    /// Any other OpenAI fields (temperature, max_tokens, tools, …), passed
    /// through to the worker untouched.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Request body for `POST /v1/embeddings`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmbeddingRequest {
    /// The embedding model identifier.
    pub model: String,
    /// A string or array of strings to embed.
    #[schema(value_type = Object)]
    pub input: serde_json::Value,
    /// Any other OpenAI fields, passed through to the worker untouched.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ── Models list ──────────────────────────────────────────────────────────────

/// A single model descriptor (OpenAI `/v1/models` format).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelInfo {
    /// Model identifier string.
    pub id: String,
    /// Always `"model"`.
    pub object: String,
    /// Unix timestamp of when the model was first seen.
    pub created: i64,
    /// Engine that owns the model on the worker side.
    pub owned_by: String,
}

/// Response body for `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelListResponse {
    /// Always `"list"`.
    pub object: String,
    /// Available models, deduplicated by name.
    pub data: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_request_fields_survive_the_round_trip() {
        let raw = serde_json::json!({
            "model": "qwen3:0.6b",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "temperature": 0.2,
            "max_tokens": 128,
        });
        let req: ChatCompletionRequest = serde_json::from_value(raw).unwrap();
        assert!(req.stream);
        assert_eq!(req.extra.get("temperature").and_then(|v| v.as_f64()), Some(0.2));

        let forwarded = serde_json::to_value(&req).unwrap();
        assert_eq!(forwarded["max_tokens"], 128);
        assert_eq!(forwarded["model"], "qwen3:0.6b");
    }
}
