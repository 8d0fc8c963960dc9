//! Fingerprint registry: the lifecycle of every in-flight request.
//!
//! A fingerprint is saved (state `Preparing`) immediately after load
//! balancing and *before* the dispatch frame is enqueued, so min-conn
//! counting already sees requests that are still in flight.  It moves to
//! `Transmitting` when the dispatcher reads the first response frame and to
//! `Completed` on any terminal outcome.  Completed rows linger for a grace
//! window so post-mortem queries still resolve, then a background sweeper
//! removes them.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintState {
    Preparing,
    Transmitting,
    Completed,
}

impl FingerprintState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintState::Preparing => "preparing",
            FingerprintState::Transmitting => "transmitting",
            FingerprintState::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintEntry {
    pub worker_id: String,
    pub state: FingerprintState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct FingerprintRegistry {
    inner: RwLock<HashMap<Uuid, FingerprintEntry>>,
}

impl FingerprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly dispatched request in state `Preparing`.
    pub async fn save(&self, fingerprint: Uuid, worker_id: &str) {
        self.inner.write().await.insert(
            fingerprint,
            FingerprintEntry {
                worker_id: worker_id.to_owned(),
                state: FingerprintState::Preparing,
                updated_at: Utc::now(),
            },
        );
    }

    /// Transition to `Transmitting`; called when the first response frame is
    /// read.
    pub async fn set_transmitting(&self, fingerprint: Uuid) {
        self.transition(fingerprint, FingerprintState::Transmitting).await;
    }

    /// Terminal transition; idempotent.
    pub async fn complete(&self, fingerprint: Uuid) {
        self.transition(fingerprint, FingerprintState::Completed).await;
    }

    async fn transition(&self, fingerprint: Uuid, state: FingerprintState) {
        if let Some(entry) = self.inner.write().await.get_mut(&fingerprint) {
            entry.state = state;
            entry.updated_at = Utc::now();
        }
    }

    pub async fn get(&self, fingerprint: Uuid) -> Option<FingerprintEntry> {
        self.inner.read().await.get(&fingerprint).cloned()
    }

    /// Number of in-flight requests on `worker_id`, for min-conn balancing.
    ///
    /// Counts `Preparing` as well as `Transmitting`: a fingerprint is saved
    /// before its dispatch frame is even enqueued precisely so that
    /// concurrent dispatches see each other here.
    pub async fn active_for(&self, worker_id: &str) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|e| e.worker_id == worker_id && e.state != FingerprintState::Completed)
            .count()
    }

    /// Remove completed rows older than `grace`.  Returns how many were
    /// swept.
    pub async fn sweep(&self, grace: Duration) -> usize {
        let cutoff = Utc::now() - grace;
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, e| e.state != FingerprintState::Completed || e.updated_at > cutoff);
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_transitions() {
        let registry = FingerprintRegistry::new();
        let fp = Uuid::new_v4();

        registry.save(fp, "w1").await;
        assert_eq!(registry.get(fp).await.map(|e| e.state), Some(FingerprintState::Preparing));

        registry.set_transmitting(fp).await;
        assert_eq!(registry.active_for("w1").await, 1);
        assert_eq!(registry.active_for("w2").await, 0);

        registry.complete(fp).await;
        assert_eq!(registry.active_for("w1").await, 0);
        assert_eq!(registry.get(fp).await.map(|e| e.state), Some(FingerprintState::Completed));
    }

    #[tokio::test]
    async fn preparing_requests_count_as_in_flight() {
        let registry = FingerprintRegistry::new();
        registry.save(Uuid::new_v4(), "w1").await;
        registry.save(Uuid::new_v4(), "w1").await;
        assert_eq!(registry.active_for("w1").await, 2);
    }

    #[tokio::test]
    async fn sweep_respects_grace_window() {
        let registry = FingerprintRegistry::new();
        let done = Uuid::new_v4();
        let live = Uuid::new_v4();
        registry.save(done, "w1").await;
        registry.save(live, "w1").await;
        registry.complete(done).await;

        // Wide grace: nothing swept yet.
        assert_eq!(registry.sweep(Duration::minutes(5)).await, 0);
        // Zero grace: only the completed row goes.
        assert_eq!(registry.sweep(Duration::zero()).await, 1);
        assert!(registry.get(done).await.is_none());
        assert!(registry.get(live).await.is_some());
    }
}
