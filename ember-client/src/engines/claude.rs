//! Claude (Anthropic messages API) adapter.
//!
//! Converts OpenAI-shaped requests into Anthropic's messages API and folds
//! the event stream back into OpenAI chunk shape: `message_start` carries
//! the input-token count, `content_block_delta` the text, `message_delta`
//! the stop reason and output-token count.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use ember_proto::{Model, ModelKind};

use crate::channel::ResponseSink;
use crate::error::EngineError;

use super::Engine;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Models advertised by this adapter.  Anthropic has no listing endpoint
/// usable with every key tier, so the set is pinned.
const KNOWN_MODELS: &[&str] = &[
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-haiku-20240307",
];

pub struct ClaudeEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ClaudeEngine {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
        }
    }

    /// OpenAI messages → Anthropic request body.  System messages move to
    /// the top-level `system` field.
    fn convert_request(request: &Value, stream: bool) -> Value {
        let mut system = Vec::new();
        let mut messages = Vec::new();
        if let Some(list) = request["messages"].as_array() {
            for message in list {
                let role = message["role"].as_str().unwrap_or("user");
                if role == "system" {
                    if let Some(text) = message["content"].as_str() {
                        system.push(text.to_owned());
                    }
                } else {
                    messages.push(json!({
                        "role": if role == "assistant" { "assistant" } else { "user" },
                        "content": message["content"],
                    }));
                }
            }
        }

        let mut body = json!({
            "model": request["model"],
            "messages": messages,
            "max_tokens": request.get("max_tokens").and_then(Value::as_u64).unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n"));
        }
        if let Some(t) = request.get("temperature").filter(|v| !v.is_null()) {
            body["temperature"] = t.clone();
        }
        body
    }

    async fn post_messages(&self, body: &Value) -> Result<reqwest::Response, EngineError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl Engine for ClaudeEngine {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn list_models(&self) -> Result<Vec<Model>, EngineError> {
        Ok(KNOWN_MODELS
            .iter()
            .map(|name| Model {
                name: (*name).to_owned(),
                engine: "claude".into(),
                kind: ModelKind::Chat,
                size: String::new(),
                quantization: String::new(),
                ippm: 0.0,
                oppm: 0.0,
            })
            .collect())
    }

    async fn supports_model(&self, model: &str) -> bool {
        KNOWN_MODELS.contains(&model) || model.starts_with("claude-")
    }

    async fn chat(&self, request: &Value, sink: &mut ResponseSink) -> Result<(), EngineError> {
        let stream = request["stream"].as_bool().unwrap_or(false);
        let model = request["model"].as_str().unwrap_or_default().to_owned();
        let fingerprint = sink.fingerprint().to_owned();
        let body = Self::convert_request(request, stream);

        if !stream {
            let response = self.post_messages(&body).await?;
            let payload: Value = response.json().await?;

            let text = payload["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| b["text"].as_str())
                        .collect::<String>()
                })
                .unwrap_or_default();
            let input = payload["usage"]["input_tokens"].as_u64().unwrap_or(0);
            let output = payload["usage"]["output_tokens"].as_u64().unwrap_or(0);

            sink.send_message(json!({
                "id": fingerprint,
                "object": "chat.completion",
                "created": Utc::now().timestamp(),
                "model": model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": text},
                    "finish_reason": "stop",
                }],
                "usage": {
                    "prompt_tokens": input,
                    "completion_tokens": output,
                    "total_tokens": input + output,
                },
            }))
            .await
            .map_err(link_err)?;
            return Ok(());
        }

        let response = self.post_messages(&body).await?;
        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        while let Some(chunk) = bytes.next().await {
            let piece = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&piece));

            while let Some(end) = buffer.find('\n') {
                let line = buffer[..end].trim().to_owned();
                buffer.drain(..=end);
                let Some(data) = line.strip_prefix("data: ") else { continue };

                let event: Value = match serde_json::from_str(data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "unparsable anthropic event; skipping");
                        continue;
                    }
                };

                match event["type"].as_str().unwrap_or_default() {
                    "message_start" => {
                        input_tokens = event["message"]["usage"]["input_tokens"]
                            .as_u64()
                            .unwrap_or(0);
                    }
                    "content_block_delta" => {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            sink.send_stream_chunk(json!({
                                "id": fingerprint,
                                "object": "chat.completion.chunk",
                                "created": Utc::now().timestamp(),
                                "model": model,
                                "choices": [{
                                    "index": 0,
                                    "delta": {"content": text},
                                    "finish_reason": null,
                                }],
                            }))
                            .await
                            .map_err(link_err)?;
                        }
                    }
                    "message_delta" => {
                        output_tokens = event["usage"]["output_tokens"]
                            .as_u64()
                            .unwrap_or(output_tokens);
                    }
                    "message_stop" => {
                        sink.send_stream_chunk(json!({
                            "id": fingerprint,
                            "object": "chat.completion.chunk",
                            "created": Utc::now().timestamp(),
                            "model": model,
                            "choices": [{
                                "index": 0,
                                "delta": {},
                                "finish_reason": "stop",
                            }],
                            "usage": {
                                "prompt_tokens": input_tokens,
                                "completion_tokens": output_tokens,
                                "total_tokens": input_tokens + output_tokens,
                            },
                        }))
                        .await
                        .map_err(link_err)?;
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn embed(&self, _request: &Value, _sink: &mut ResponseSink) -> Result<(), EngineError> {
        Err(EngineError::UnsupportedOperation("claude"))
    }
}

fn link_err(e: crate::error::LinkError) -> EngineError {
    EngineError::Api { status: 0, body: format!("response channel write failed: {e}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_move_to_the_system_field() {
        let request = json!({
            "model": "claude-3-5-haiku-20241022",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        });
        let body = ClaudeEngine::convert_request(&request, false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn model_prefix_match_accepts_unlisted_claude_models() {
        let engine = ClaudeEngine::new("https://api.anthropic.com/v1", "k");
        assert!(futures::executor::block_on(engine.supports_model("claude-3-5-sonnet-20241022")));
        assert!(futures::executor::block_on(engine.supports_model("claude-next-preview")));
        assert!(!futures::executor::block_on(engine.supports_model("gpt-4o")));
    }
}
