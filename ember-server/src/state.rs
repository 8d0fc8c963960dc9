//! Shared application state injected into every Axum handler.
//!
//! The four routing registries are separate fields rather than one opaque
//! object so tests can construct exactly the subset they exercise.

use std::sync::Arc;

use crate::auth::codes::CodeCache;
use crate::auth::register_tokens::RegisterTokenCache;
use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::registry::balancer::Balancer;
use crate::registry::fingerprints::FingerprintRegistry;
use crate::registry::models::ModelRegistry;
use crate::registry::responses::ResponseRouter;

/// State shared across all HTTP handlers and the worker sessions.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Persistent store (users, keys, workers, usage, trends).
    pub store: Arc<SqliteStore>,
    /// Model name → advertising workers.
    pub models: Arc<ModelRegistry>,
    /// In-flight request lifecycle.
    pub fingerprints: Arc<FingerprintRegistry>,
    /// Per-fingerprint response-channel readiness.
    pub responses: Arc<ResponseRouter>,
    /// Worker selection policy + round-robin counters.
    pub balancer: Arc<Balancer>,
    /// Single-use worker join tokens.
    pub register_tokens: Arc<RegisterTokenCache>,
    /// Email verification codes for account registration.
    pub codes: Arc<CodeCache>,
}

impl AppState {
    pub fn new(config: Config, store: SqliteStore) -> Self {
        let balancer = Balancer::new(config.balance_policy);
        let register_tokens = RegisterTokenCache::new(config.register_token_expiry_secs);
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            models: Arc::new(ModelRegistry::new()),
            fingerprints: Arc::new(FingerprintRegistry::new()),
            responses: Arc::new(ResponseRouter::new()),
            balancer: Arc::new(balancer),
            register_tokens: Arc::new(register_tokens),
            codes: Arc::new(CodeCache::new()),
        }
    }
}
