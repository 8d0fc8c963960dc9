//! Worker selection over a pruned candidate list.
//!
//! Candidates arrive already pruned and in ascending worker-id order (see
//! [`super::models::ModelRegistry::candidates`]).  Every policy returns
//! `None` on an empty list, which the dispatcher surfaces as HTTP 400
//! `"No available client"`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;

use super::fingerprints::FingerprintRegistry;
use super::worker::Worker;

/// Selection policy, parsed from the `LBA` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancePolicy {
    #[default]
    RoundRobin,
    Random,
    MinConn,
}

/// Parse failure for `LBA`; aborts startup.
#[derive(Debug, thiserror::Error)]
#[error("unknown load-balancing policy: {0}")]
pub struct PolicyParseError(String);

impl FromStr for BalancePolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(BalancePolicy::RoundRobin),
            "random" => Ok(BalancePolicy::Random),
            "min-conn" => Ok(BalancePolicy::MinConn),
            other => Err(PolicyParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Default)]
pub struct Balancer {
    policy: BalancePolicy,
    /// Per-model monotonically increasing round-robin counter.  Never
    /// rewound on worker removal; a removal between selections can skip a
    /// worker once, which is accepted behavior.
    rr_index: Mutex<HashMap<String, usize>>,
}

impl Balancer {
    pub fn new(policy: BalancePolicy) -> Self {
        Self { policy, rr_index: Mutex::new(HashMap::new()) }
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    /// Pick one worker for `model` out of `candidates`, or `None` when the
    /// list is empty.
    pub async fn select(
        &self,
        model: &str,
        candidates: &[Arc<Worker>],
        fingerprints: &FingerprintRegistry,
    ) -> Option<Arc<Worker>> {
        if candidates.is_empty() {
            return None;
        }
        match self.policy {
            BalancePolicy::RoundRobin => {
                let mut indices = self.rr_index.lock().await;
                let counter = indices.entry(model.to_owned()).or_insert(0);
                let picked = Arc::clone(&candidates[*counter % candidates.len()]);
                *counter = counter.wrapping_add(1);
                Some(picked)
            }
            BalancePolicy::Random => {
                let i = rand::thread_rng().gen_range(0..candidates.len());
                Some(Arc::clone(&candidates[i]))
            }
            BalancePolicy::MinConn => {
                // Most idle slots wins; candidates are id-ascending, so the
                // first maximum is also the lowest-id tie-break.
                let mut best: Option<(i64, &Arc<Worker>)> = None;
                for worker in candidates {
                    let active = fingerprints.active_for(&worker.id).await as i64;
                    let idle = i64::from(worker.max_parallel()) - active;
                    match best {
                        Some((best_idle, _)) if best_idle >= idle => {}
                        _ => best = Some((idle, worker)),
                    }
                }
                best.map(|(_, w)| Arc::clone(w))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::super::worker::test_support::online_worker;
    use super::*;

    async fn workers(
        n: usize,
        num_parallel: u32,
    ) -> (Vec<Arc<Worker>>, Vec<tokio::sync::mpsc::Receiver<ember_proto::Frame>>) {
        let mut out = Vec::new();
        let mut mailboxes = Vec::new();
        for i in 0..n {
            let (w, rx) = online_worker(&format!("w{i}"), "u1", Vec::new(), num_parallel).await;
            out.push(w);
            mailboxes.push(rx);
        }
        (out, mailboxes)
    }

    #[tokio::test]
    async fn empty_candidates_yield_none() {
        let balancer = Balancer::new(BalancePolicy::RoundRobin);
        let fingerprints = FingerprintRegistry::new();
        assert!(balancer.select("m", &[], &fingerprints).await.is_none());
    }

    #[tokio::test]
    async fn round_robin_hits_each_candidate_once_per_cycle() {
        let balancer = Balancer::new(BalancePolicy::RoundRobin);
        let fingerprints = FingerprintRegistry::new();
        let (candidates, _mailboxes) = workers(3, 1).await;

        for _cycle in 0..3 {
            let mut seen = std::collections::HashSet::new();
            for _ in 0..candidates.len() {
                let picked = balancer
                    .select("m", &candidates, &fingerprints)
                    .await
                    .expect("candidate");
                seen.insert(picked.id.clone());
            }
            assert_eq!(seen.len(), candidates.len(), "each worker exactly once per cycle");
        }
    }

    #[tokio::test]
    async fn round_robin_counters_are_per_model() {
        let balancer = Balancer::new(BalancePolicy::RoundRobin);
        let fingerprints = FingerprintRegistry::new();
        let (candidates, _mailboxes) = workers(2, 1).await;

        let a = balancer.select("m1", &candidates, &fingerprints).await.unwrap();
        let b = balancer.select("m2", &candidates, &fingerprints).await.unwrap();
        assert_eq!(a.id, b.id, "independent counters both start at zero");
    }

    #[tokio::test]
    async fn random_stays_within_candidates() {
        let balancer = Balancer::new(BalancePolicy::Random);
        let fingerprints = FingerprintRegistry::new();
        let (candidates, _mailboxes) = workers(4, 1).await;
        let ids: std::collections::HashSet<String> =
            candidates.iter().map(|w| w.id.clone()).collect();

        for _ in 0..32 {
            let picked = balancer.select("m", &candidates, &fingerprints).await.unwrap();
            assert!(ids.contains(&picked.id));
        }
    }

    #[tokio::test]
    async fn min_conn_prefers_most_idle() {
        let balancer = Balancer::new(BalancePolicy::MinConn);
        let fingerprints = FingerprintRegistry::new();
        let (candidates, _mailboxes) = workers(2, 2).await;

        // w0 has one transmitting request, w1 none → w1 is more idle.
        let fp = Uuid::new_v4();
        fingerprints.save(fp, "w0").await;
        fingerprints.set_transmitting(fp).await;

        let picked = balancer.select("m", &candidates, &fingerprints).await.unwrap();
        assert_eq!(picked.id, "w1");
    }

    #[tokio::test]
    async fn min_conn_ties_break_to_lowest_id() {
        let balancer = Balancer::new(BalancePolicy::MinConn);
        let fingerprints = FingerprintRegistry::new();
        let (candidates, _mailboxes) = workers(3, 2).await;

        let picked = balancer.select("m", &candidates, &fingerprints).await.unwrap();
        assert_eq!(picked.id, "w0");
    }

    #[tokio::test]
    async fn min_conn_sees_preparing_requests() {
        let balancer = Balancer::new(BalancePolicy::MinConn);
        let fingerprints = FingerprintRegistry::new();
        let (candidates, _mailboxes) = workers(2, 1).await;

        // A dispatch that has not opened its response channel yet still
        // occupies a slot on w0.
        fingerprints.save(Uuid::new_v4(), "w0").await;
        let picked = balancer.select("m", &candidates, &fingerprints).await.unwrap();
        assert_eq!(picked.id, "w1");
    }

    #[tokio::test]
    async fn min_conn_never_piles_concurrent_dispatches_on_one_worker() {
        let balancer = Balancer::new(BalancePolicy::MinConn);
        let fingerprints = FingerprintRegistry::new();
        let (candidates, _mailboxes) = workers(2, 2).await;

        let mut per_worker: std::collections::HashMap<String, usize> = Default::default();
        for _ in 0..3 {
            let picked = balancer.select("m", &candidates, &fingerprints).await.unwrap();
            fingerprints.save(Uuid::new_v4(), &picked.id).await;
            *per_worker.entry(picked.id.clone()).or_default() += 1;
        }
        // Three concurrent requests over two dual-slot workers: 2+1 in either
        // direction, never 3+0.
        assert_eq!(per_worker.values().max(), Some(&2));
        assert_eq!(per_worker.len(), 2);
    }
}
