//! Engine adapters: the bridge between the wire protocol and whatever is
//! actually serving models on this machine.
//!
//! Each adapter translates an OpenAI-shaped request into its engine's API,
//! streams the result back through the per-request [`ResponseSink`], and
//! reports usage in OpenAI naming so the broker can meter without knowing
//! which engine ran the request.

pub mod claude;
pub mod ollama;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use ember_proto::Model;

use crate::channel::ResponseSink;
use crate::config::Config;
use crate::error::EngineError;

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Models currently served by this engine, without pricing (the
    /// [`PriceTable`] stamps prices at advertisement time).
    async fn list_models(&self) -> Result<Vec<Model>, EngineError>;

    async fn supports_model(&self, model: &str) -> bool;

    /// Serve a chat request.  Streamed requests emit `MESSAGE_STREAM` frames
    /// ending in a chunk that carries `finish_reason` and `usage`; unary
    /// requests emit exactly one `MESSAGE`.
    async fn chat(&self, request: &Value, sink: &mut ResponseSink) -> Result<(), EngineError>;

    /// Serve an embedding request with one `EMBEDDING_RESPONSE`.
    async fn embed(&self, request: &Value, sink: &mut ResponseSink) -> Result<(), EngineError>;
}

// ── Price table ──────────────────────────────────────────────────────────────

/// Advertised prices: defaults from the CLI, overridable per model through
/// the local UI socket.
#[derive(Debug)]
pub struct PriceTable {
    default_ippm: f64,
    default_oppm: f64,
    overrides: RwLock<HashMap<String, (f64, f64)>>,
}

impl PriceTable {
    pub fn new(default_ippm: f64, default_oppm: f64) -> Self {
        Self { default_ippm, default_oppm, overrides: RwLock::new(HashMap::new()) }
    }

    pub async fn set(&self, model: &str, ippm: f64, oppm: f64) {
        self.overrides.write().await.insert(model.to_owned(), (ippm, oppm));
    }

    pub async fn apply(&self, mut models: Vec<Model>) -> Vec<Model> {
        let overrides = self.overrides.read().await;
        for model in &mut models {
            let (ippm, oppm) = overrides
                .get(&model.name)
                .copied()
                .unwrap_or((self.default_ippm, self.default_oppm));
            model.ippm = ippm;
            model.oppm = oppm;
        }
        models
    }
}

// ── Engine set ───────────────────────────────────────────────────────────────

/// The engines this worker exposes, in configuration order.
pub struct EngineSet {
    engines: Vec<Arc<dyn Engine>>,
    prices: Arc<PriceTable>,
}

impl EngineSet {
    /// Build the set selected by `--engine`; fails when nothing usable is
    /// configured.
    pub async fn from_config(cfg: &Config, prices: Arc<PriceTable>) -> anyhow::Result<Self> {
        let mut engines: Vec<Arc<dyn Engine>> = Vec::new();

        let want = cfg.engine.as_str();
        let want_all = want == "all";

        if want == "ollama" || want_all {
            match ollama::OllamaEngine::connect(&cfg.ollama_host).await {
                Ok(engine) => engines.push(Arc::new(engine)),
                Err(e) if want_all => warn!(error = %e, "ollama engine unavailable; skipping"),
                Err(e) => return Err(e.into()),
            }
        }
        if want == "openai" || want_all {
            if cfg.openai_key.is_empty() {
                if !want_all {
                    anyhow::bail!("--openai-key (or OPENAI_API_KEY) is required for the openai engine");
                }
            } else {
                engines.push(Arc::new(openai::OpenAiEngine::new(&cfg.openai_url, &cfg.openai_key)));
            }
        }
        if want == "claude" || want_all {
            if cfg.claude_key.is_empty() {
                if !want_all {
                    anyhow::bail!("--claude-key (or ANTHROPIC_API_KEY) is required for the claude engine");
                }
            } else {
                engines.push(Arc::new(claude::ClaudeEngine::new(&cfg.claude_url, &cfg.claude_key)));
            }
        }

        if !matches!(want, "ollama" | "openai" | "claude" | "all") {
            anyhow::bail!("unknown engine selection: {want}");
        }
        if engines.is_empty() {
            anyhow::bail!("no usable inference engine configured");
        }

        Ok(Self { engines, prices })
    }

    /// Every model across every engine, priced for advertisement.
    pub async fn advertised_models(&self) -> Vec<Model> {
        let mut all = Vec::new();
        for engine in &self.engines {
            match engine.list_models().await {
                Ok(models) => all.extend(models),
                Err(e) => warn!(engine = engine.name(), error = %e, "model listing failed"),
            }
        }
        self.prices.apply(all).await
    }

    /// The first engine claiming `model`.
    pub async fn engine_for(&self, model: &str) -> Option<Arc<dyn Engine>> {
        for engine in &self.engines {
            if engine.supports_model(model).await {
                return Some(Arc::clone(engine));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn price_table_applies_defaults_and_overrides() {
        let prices = PriceTable::new(4.0, 8.0);
        prices.set("special", 1.5, 2.5).await;

        let models = vec![
            Model {
                name: "plain".into(),
                engine: "ollama".into(),
                kind: Default::default(),
                size: String::new(),
                quantization: String::new(),
                ippm: 0.0,
                oppm: 0.0,
            },
            Model {
                name: "special".into(),
                engine: "ollama".into(),
                kind: Default::default(),
                size: String::new(),
                quantization: String::new(),
                ippm: 0.0,
                oppm: 0.0,
            },
        ];

        let priced = prices.apply(models).await;
        assert_eq!((priced[0].ippm, priced[0].oppm), (4.0, 8.0));
        assert_eq!((priced[1].ippm, priced[1].oppm), (1.5, 2.5));
    }
}
