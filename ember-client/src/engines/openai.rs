//! OpenAI-compatible adapter.
//!
//! The wire protocol already speaks OpenAI shapes, so this adapter is mostly
//! a relay: request bodies pass through (with `stream_options.include_usage`
//! forced on for streams so the broker gets a tally), and SSE chunks are
//! forwarded frame-for-frame.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::warn;

use ember_proto::{Model, ModelKind};

use crate::channel::ResponseSink;
use crate::error::EngineError;

use super::Engine;

pub struct OpenAiEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    known: RwLock<std::collections::HashSet<String>>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiEngine {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            known: RwLock::new(Default::default()),
        }
    }

    fn model_kind(name: &str) -> ModelKind {
        let lower = name.to_ascii_lowercase();
        if lower.contains("embed") || lower.contains("similarity") || lower.contains("search") {
            ModelKind::Embedding
        } else {
            ModelKind::Chat
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, EngineError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
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
impl Engine for OpenAiEngine {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn list_models(&self) -> Result<Vec<Model>, EngineError> {
        let parsed: ModelsResponse = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut known = self.known.write().await;
        known.clear();
        Ok(parsed
            .data
            .into_iter()
            .map(|entry| {
                known.insert(entry.id.clone());
                Model {
                    kind: Self::model_kind(&entry.id),
                    name: entry.id,
                    engine: "openai".into(),
                    size: String::new(),
                    quantization: String::new(),
                    ippm: 0.0,
                    oppm: 0.0,
                }
            })
            .collect())
    }

    async fn supports_model(&self, model: &str) -> bool {
        if self.known.read().await.contains(model) {
            return true;
        }
        if self.list_models().await.is_err() {
            return false;
        }
        self.known.read().await.contains(model)
    }

    async fn chat(&self, request: &Value, sink: &mut ResponseSink) -> Result<(), EngineError> {
        let stream = request["stream"].as_bool().unwrap_or(false);

        if !stream {
            let response = self.post("/chat/completions", request).await?;
            let payload: Value = response.json().await?;
            sink.send_message(payload).await.map_err(link_err)?;
            return Ok(());
        }

        // Force a usage tally onto the final chunk.
        let mut body = request.clone();
        body["stream_options"] = json!({"include_usage": true});

        let response = self.post("/chat/completions", &body).await?;
        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = bytes.next().await {
            let piece = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&piece));

            while let Some(end) = buffer.find('\n') {
                let line = buffer[..end].trim().to_owned();
                buffer.drain(..=end);

                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data == "[DONE]" {
                    return Ok(());
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(payload) => {
                        sink.send_stream_chunk(payload).await.map_err(link_err)?;
                    }
                    Err(e) => warn!(error = %e, "unparsable SSE chunk from upstream; skipping"),
                }
            }
        }
        Ok(())
    }

    async fn embed(&self, request: &Value, sink: &mut ResponseSink) -> Result<(), EngineError> {
        let response = self.post("/embeddings", request).await?;
        let payload: Value = response.json().await?;
        sink.send_embedding(payload).await.map_err(link_err)?;
        Ok(())
    }
}

fn link_err(e: crate::error::LinkError) -> EngineError {
    EngineError::Api { status: 0, body: format!("response channel write failed: {e}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_models_are_classified_by_name() {
        assert_eq!(OpenAiEngine::model_kind("text-embedding-3-small"), ModelKind::Embedding);
        assert_eq!(OpenAiEngine::model_kind("gpt-4o-mini"), ModelKind::Chat);
    }
}
