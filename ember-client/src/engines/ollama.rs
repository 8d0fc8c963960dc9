//! Ollama adapter.
//!
//! Talks to the local Ollama daemon's native API and converts between its
//! NDJSON streaming shape and the OpenAI shapes the wire protocol carries.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use ember_proto::{Model, ModelKind};

use crate::channel::ResponseSink;
use crate::error::EngineError;

use super::Engine;

pub struct OllamaEngine {
    client: reqwest::Client,
    base_url: String,
    /// Names seen in the last listing, for cheap supports_model checks.
    known: RwLock<std::collections::HashSet<String>>,
}

// ── Ollama API shapes ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    details: TagDetails,
}

#[derive(Debug, Default, Deserialize)]
struct TagDetails {
    #[serde(default)]
    quantization_level: String,
}

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: ChatLineMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f64>>,
    #[serde(default)]
    prompt_eval_count: u64,
}

impl OllamaEngine {
    /// Connect and verify the daemon is reachable.
    pub async fn connect(base_url: &str) -> Result<Self, EngineError> {
        let engine = Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            known: RwLock::new(Default::default()),
        };
        // Heartbeat: the daemon answers `/` with a banner.
        let response = engine.client.get(engine.base_url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Api {
                status: response.status().as_u16(),
                body: "ollama daemon not reachable".into(),
            });
        }
        if let Err(e) = engine.list_models().await {
            warn!(error = %e, "initial ollama model listing failed");
        }
        Ok(engine)
    }

    fn model_kind(name: &str) -> ModelKind {
        let lower = name.to_ascii_lowercase();
        if lower.contains("embed") || lower.contains("bge-") || lower.contains("reranker") {
            ModelKind::Embedding
        } else {
            ModelKind::Chat
        }
    }
}

#[async_trait]
impl Engine for OllamaEngine {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn list_models(&self) -> Result<Vec<Model>, EngineError> {
        // Running models first; fall back to everything pulled when nothing
        // is loaded yet.
        let mut tags: TagsResponse = self
            .client
            .get(format!("{}/api/ps", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if tags.models.is_empty() {
            tags = self
                .client
                .get(format!("{}/api/tags", self.base_url))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
        }

        let mut known = self.known.write().await;
        known.clear();
        let models = tags
            .models
            .into_iter()
            .map(|m| {
                known.insert(m.name.clone());
                Model {
                    kind: Self::model_kind(&m.name),
                    name: m.name,
                    engine: "ollama".into(),
                    size: format!("{}", m.size),
                    quantization: m.details.quantization_level,
                    ippm: 0.0,
                    oppm: 0.0,
                }
            })
            .collect();
        Ok(models)
    }

    async fn supports_model(&self, model: &str) -> bool {
        if self.known.read().await.contains(model) {
            return true;
        }
        // Refresh once; the model may have been pulled since the last look.
        if self.list_models().await.is_err() {
            return false;
        }
        self.known.read().await.contains(model)
    }

    async fn chat(&self, request: &Value, sink: &mut ResponseSink) -> Result<(), EngineError> {
        let model = request["model"].as_str().unwrap_or_default().to_owned();
        let stream = request["stream"].as_bool().unwrap_or(false);
        let fingerprint = sink.fingerprint().to_owned();

        let mut body = json!({
            "model": model,
            "messages": request["messages"],
            "stream": stream,
        });
        if let Some(options) = chat_options(request) {
            body["options"] = options;
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api { status, body });
        }

        // The native API answers NDJSON for both modes; unary is a single
        // line.
        let mut lines = response.bytes_stream();
        let mut buffer = String::new();
        let mut full_content = String::new();

        while let Some(chunk) = lines.next().await {
            let bytes = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(end) = buffer.find('\n') {
                let line = buffer[..end].trim().to_owned();
                buffer.drain(..=end);
                if line.is_empty() {
                    continue;
                }
                let parsed: ChatLine = match serde_json::from_str(&line) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(error = %e, "unparsable ollama chat line; skipping");
                        continue;
                    }
                };

                if stream {
                    if !parsed.done {
                        sink.send_stream_chunk(stream_chunk(&fingerprint, &parsed.model, &parsed.message.content, None))
                            .await
                            .map_err(to_engine_err)?;
                    } else {
                        // Final chunk carries finish_reason and the tally in
                        // one frame.
                        let mut last = stream_chunk(&fingerprint, &parsed.model, "", Some("stop"));
                        last["usage"] = usage_json(parsed.prompt_eval_count, parsed.eval_count);
                        sink.send_stream_chunk(last).await.map_err(to_engine_err)?;
                        debug!(fingerprint, "ollama stream complete");
                        return Ok(());
                    }
                } else {
                    full_content.push_str(&parsed.message.content);
                    if parsed.done {
                        let payload = json!({
                            "id": fingerprint,
                            "object": "chat.completion",
                            "created": Utc::now().timestamp(),
                            "model": parsed.model,
                            "choices": [{
                                "index": 0,
                                "message": {"role": "assistant", "content": full_content},
                                "finish_reason": "stop",
                            }],
                            "usage": usage_json(parsed.prompt_eval_count, parsed.eval_count),
                        });
                        sink.send_message(payload).await.map_err(to_engine_err)?;
                        return Ok(());
                    }
                }
            }
        }

        Err(EngineError::Api { status: 0, body: "ollama stream ended without a done line".into() })
    }

    async fn embed(&self, request: &Value, sink: &mut ResponseSink) -> Result<(), EngineError> {
        let model = request["model"].as_str().unwrap_or_default().to_owned();
        let body = json!({ "model": model, "input": request["input"] });

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api { status, body });
        }
        let parsed: EmbedResponse = response.json().await?;

        let data: Vec<Value> = parsed
            .embeddings
            .iter()
            .enumerate()
            .map(|(index, embedding)| json!({"object": "embedding", "index": index, "embedding": embedding}))
            .collect();
        let payload = json!({
            "object": "list",
            "model": model,
            "data": data,
            "usage": {
                "prompt_tokens": parsed.prompt_eval_count,
                "total_tokens": parsed.prompt_eval_count,
            },
        });
        sink.send_embedding(payload).await.map_err(to_engine_err)?;
        Ok(())
    }
}

// ── Conversions ──────────────────────────────────────────────────────────────

fn chat_options(request: &Value) -> Option<Value> {
    let mut options = serde_json::Map::new();
    if let Some(t) = request.get("temperature").filter(|v| !v.is_null()) {
        options.insert("temperature".into(), t.clone());
    }
    if let Some(n) = request.get("max_tokens").filter(|v| !v.is_null()) {
        options.insert("num_predict".into(), n.clone());
    }
    (!options.is_empty()).then(|| Value::Object(options))
}

fn stream_chunk(fingerprint: &str, model: &str, content: &str, finish: Option<&str>) -> Value {
    json!({
        "id": fingerprint,
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": if finish.is_some() { json!({}) } else { json!({"content": content}) },
            "finish_reason": finish,
        }],
    })
}

fn usage_json(prompt: u64, completion: u64) -> Value {
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion,
    })
}

fn to_engine_err(e: crate::error::LinkError) -> EngineError {
    EngineError::Api { status: 0, body: format!("response channel write failed: {e}") }
}
