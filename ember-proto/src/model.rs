//! Model descriptors, registration payloads, and accounting payloads.

use serde::{Deserialize, Serialize};

/// What a model can do, as advertised by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Chat,
    Embedding,
}

/// One model advertised by a worker.
///
/// Prices are per million tokens (`ippm` input, `oppm` output) and are
/// clamped by the broker on ingest against the operator-configured caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    /// Owning engine, e.g. `"ollama"`, `"openai"`, `"claude"`.
    pub engine: String,
    #[serde(rename = "type", default)]
    pub kind: ModelKind,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub quantization: String,
    #[serde(default)]
    pub ippm: f64,
    #[serde(default)]
    pub oppm: f64,
}

/// Engine metadata sent with registration, used by min-conn balancing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngineInfo {
    #[serde(default)]
    pub name: String,
    /// Concurrent requests this worker can serve; `0` means "unspecified"
    /// and is treated as 1 by the broker.
    #[serde(default)]
    pub num_parallel: u32,
}

/// Content of the `REGISTER` frame, sent once by a worker after the control
/// channel opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInfo {
    pub id: String,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub engine: EngineInfo,
}

/// Token counts in OpenAI naming, harvested from response payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTally {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl UsageTally {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

/// Content of the `INCOME` frame sent to a worker after a request completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeNotice {
    pub model: String,
    pub usage: UsageTally,
    /// Revenue of this single request.
    pub income: f64,
    /// Cumulative revenue across all workers owned by the same account.
    pub total_income: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_kind_field_rides_as_type() {
        let m = Model {
            name: "bge-m3".into(),
            engine: "ollama".into(),
            kind: ModelKind::Embedding,
            size: String::new(),
            quantization: String::new(),
            ippm: 0.1,
            oppm: 0.0,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "embedding");
    }

    #[test]
    fn register_info_tolerates_missing_optionals() {
        let info: RegisterInfo = serde_json::from_str(r#"{"id":"w1"}"#).unwrap();
        assert_eq!(info.id, "w1");
        assert!(info.models.is_empty());
        assert_eq!(info.engine.num_parallel, 0);
    }
}
