//! Worker configuration: CLI flags with environment-variable overrides.

use clap::Parser;

/// Contribute local LLM capacity to an Ember broker.
#[derive(Debug, Clone, Parser)]
#[command(name = "ember-client", version)]
pub struct Config {
    /// Broker host:port (no scheme).
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub host: String,

    /// Single-use join token from `POST /api/user/register-token`.
    #[arg(long, default_value = "")]
    pub token: String,

    /// Local inference engines to expose: `ollama`, `openai`, `claude`, or
    /// `all`.
    #[arg(long, default_value = "ollama")]
    pub engine: String,

    /// Ollama API endpoint.
    #[arg(long, default_value = "http://localhost:11434")]
    pub ollama_host: String,

    /// API key for the OpenAI-compatible engine.
    #[arg(long, default_value = "")]
    pub openai_key: String,

    /// Base URL for the OpenAI-compatible engine.
    #[arg(long, default_value = "https://api.openai.com/v1")]
    pub openai_url: String,

    /// Anthropic API key for the Claude engine.
    #[arg(long, default_value = "")]
    pub claude_key: String,

    /// Anthropic API base URL.
    #[arg(long, default_value = "https://api.anthropic.com/v1")]
    pub claude_url: String,

    /// Concurrent requests this worker accepts (min-conn balancing hint).
    #[arg(long, default_value_t = 1)]
    pub num_parallel: u32,

    /// Default advertised input price per million tokens.
    #[arg(long, default_value_t = 4.0)]
    pub default_ippm: f64,

    /// Default advertised output price per million tokens.
    #[arg(long, default_value_t = 8.0)]
    pub default_oppm: f64,

    /// Local UI socket address for income notifications and price updates.
    #[arg(long, default_value = "127.0.0.1:4319")]
    pub ui_addr: String,

    /// Disable the local UI socket entirely.
    #[arg(long, default_value_t = false)]
    pub no_ui: bool,

    /// `tracing` filter string.
    #[arg(long, default_value = "info")]
    pub log: String,
}

impl Config {
    /// Parse flags, then let environment variables override them.
    pub fn load() -> Self {
        let mut cfg = Self::parse();
        env_override(&mut cfg.host, "EMBER_HOST");
        env_override(&mut cfg.token, "EMBER_TOKEN");
        env_override(&mut cfg.engine, "EMBER_ENGINE");
        env_override(&mut cfg.ollama_host, "OLLAMA_HOST");
        env_override(&mut cfg.openai_key, "OPENAI_API_KEY");
        env_override(&mut cfg.openai_url, "OPENAI_API_BASE");
        env_override(&mut cfg.claude_key, "ANTHROPIC_API_KEY");
        cfg
    }
}

fn env_override(slot: &mut String, key: &str) {
    if let Ok(value) = std::env::var(key) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

/// Stable worker id: SHA-256 of the first non-empty MAC address, or a random
/// UUID when none can be read.  The MAC hash keeps the id stable across
/// restarts so the broker's ownership and income rows accumulate on one row.
pub fn worker_id() -> String {
    if let Some(mac) = first_mac_address() {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(mac.as_bytes());
        return digest.iter().map(|b| format!("{b:02x}")).collect();
    }
    uuid::Uuid::new_v4().to_string()
}

#[cfg(target_os = "linux")]
fn first_mac_address() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        if entry.file_name().to_str() == Some("lo") {
            continue;
        }
        if let Ok(raw) = std::fs::read_to_string(entry.path().join("address")) {
            let mac = raw.trim();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                return Some(mac.to_owned());
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn first_mac_address() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_is_stable_per_machine() {
        let a = worker_id();
        let b = worker_id();
        // Either both MAC-derived (equal) or both random UUIDs (different but
        // well-formed).
        if a.len() == 64 {
            assert_eq!(a, b);
        } else {
            assert!(uuid::Uuid::parse_str(&a).is_ok());
        }
    }
}
