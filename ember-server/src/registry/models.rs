//! Model registry: model name → the workers currently advertising it.
//!
//! The mapping is many-to-many: a model name resolves to every worker
//! advertising it, and a worker typically advertises several models.  Entries
//! are pruned lazily on access — a candidate is dropped when its session is
//! gone, its status is not online, its latency is at or above the configured
//! bound, or it no longer advertises the model.  Pruning snapshots the
//! candidate set under the read lock and applies removals under a short write
//! lock so readers are never held across worker I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use ember_proto::Model;

use super::worker::Worker;

/// One marketplace listing: a model offered by one worker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelOffer {
    pub worker_id: String,
    pub latency_ms: i64,
    pub size: String,
    pub quantization: String,
    pub ippm: f64,
    pub oppm: f64,
}

/// The marketplace view of one model across all advertising workers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MarketplaceModel {
    pub name: String,
    pub engine: String,
    #[serde(rename = "type")]
    pub kind: ember_proto::ModelKind,
    pub offers: Vec<ModelOffer>,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    // BTreeMap keyed by worker id: candidate order is stable and ascending,
    // which keeps round-robin deterministic.
    inner: RwLock<HashMap<String, BTreeMap<String, Arc<Worker>>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert that `worker` advertises `model`.  Idempotent.
    pub async fn register(&self, model: &str, worker: &Arc<Worker>) {
        let mut map = self.inner.write().await;
        map.entry(model.to_owned())
            .or_default()
            .insert(worker.id.clone(), Arc::clone(worker));
    }

    /// Remove every entry owned by `worker_id` (session teardown).
    pub async fn deregister_worker(&self, worker_id: &str) {
        let mut map = self.inner.write().await;
        map.retain(|_, workers| {
            workers.remove(worker_id);
            !workers.is_empty()
        });
    }

    /// Live candidates for `model`, in ascending worker-id order, with stale
    /// entries pruned from the registry as a side effect.
    pub async fn candidates(&self, model: &str, max_latency_ms: i64) -> Vec<Arc<Worker>> {
        // Snapshot under the read lock; health checks touch per-worker state
        // and must not run under the registry lock.
        let snapshot: Vec<Arc<Worker>> = {
            let map = self.inner.read().await;
            match map.get(model) {
                Some(workers) => workers.values().cloned().collect(),
                None => return Vec::new(),
            }
        };

        let mut live = Vec::with_capacity(snapshot.len());
        let mut stale: Vec<String> = Vec::new();
        for worker in snapshot {
            let healthy = worker.is_alive().await
                && worker.latency_ms() < max_latency_ms
                && worker.advertised(model).await.is_some();
            if healthy {
                live.push(worker);
            } else {
                stale.push(worker.id.clone());
            }
        }

        if !stale.is_empty() {
            debug!(model, pruned = stale.len(), "pruning stale model entries");
            let mut map = self.inner.write().await;
            if let Some(workers) = map.get_mut(model) {
                for id in &stale {
                    workers.remove(id);
                }
                if workers.is_empty() {
                    map.remove(model);
                }
            }
        }

        live
    }

    /// The marketplace view: every model with its live offers, pruned the
    /// same way as selection.
    pub async fn marketplace_view(&self, max_latency_ms: i64) -> Vec<MarketplaceModel> {
        let names: Vec<String> = {
            let map = self.inner.read().await;
            map.keys().cloned().collect()
        };

        let mut view = Vec::with_capacity(names.len());
        for name in names {
            let workers = self.candidates(&name, max_latency_ms).await;
            if workers.is_empty() {
                continue;
            }
            let mut engine = String::new();
            let mut kind = ember_proto::ModelKind::Chat;
            let mut offers = Vec::with_capacity(workers.len());
            for worker in &workers {
                if let Some(model) = worker.advertised(&name).await {
                    engine = model.engine.clone();
                    kind = model.kind;
                    offers.push(ModelOffer {
                        worker_id: worker.id.clone(),
                        latency_ms: worker.latency_ms(),
                        size: model.size,
                        quantization: model.quantization,
                        ippm: model.ippm,
                        oppm: model.oppm,
                    });
                }
            }
            if !offers.is_empty() {
                view.push(MarketplaceModel { name, engine, kind, offers });
            }
        }
        view.sort_by(|a, b| a.name.cmp(&b.name));
        view
    }

    /// Deduplicated model names for the OpenAI `/v1/models` endpoint.
    pub async fn openai_view(&self, max_latency_ms: i64) -> Vec<Model> {
        let mut seen = std::collections::HashSet::new();
        let mut models = Vec::new();
        for entry in self.marketplace_view(max_latency_ms).await {
            if seen.insert(entry.name.clone()) {
                models.push(Model {
                    name: entry.name,
                    engine: entry.engine,
                    kind: entry.kind,
                    size: String::new(),
                    quantization: String::new(),
                    ippm: entry.offers.first().map(|o| o.ippm).unwrap_or(0.0),
                    oppm: entry.offers.first().map(|o| o.oppm).unwrap_or(0.0),
                });
            }
        }
        models
    }
}
