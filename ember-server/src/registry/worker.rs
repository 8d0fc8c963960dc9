//! The per-worker handle shared between a session and the registries.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock};

use ember_proto::{EngineInfo, Frame, Model};

/// Connection state of a worker, driven only by its own session tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Connecting,
    Online,
    Offline,
}

/// A connected worker.
///
/// The session owns the control WebSocket; everything else in the broker
/// interacts with the worker exclusively through this handle.  All outbound
/// traffic goes through the bounded `outbound` mailbox, which a single writer
/// task drains into the socket, so frame writes are totally ordered and never
/// interleave.
#[derive(Debug)]
pub struct Worker {
    pub id: String,
    pub user_id: String,
    pub remote_addr: String,
    pub register_time: DateTime<Utc>,
    pub engine: EngineInfo,

    status: RwLock<WorkerStatus>,
    latency_ms: AtomicI64,
    models: RwLock<Vec<Model>>,

    outbound: mpsc::Sender<Frame>,
    cancel: watch::Sender<bool>,
}

impl Worker {
    pub fn new(
        id: String,
        user_id: String,
        remote_addr: String,
        engine: EngineInfo,
        models: Vec<Model>,
        outbound: mpsc::Sender<Frame>,
        cancel: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            user_id,
            remote_addr,
            register_time: Utc::now(),
            engine,
            status: RwLock::new(WorkerStatus::Connecting),
            // Optimistic until the first pong: a freshly registered worker is
            // selectable immediately instead of waiting out a keepalive cycle.
            latency_ms: AtomicI64::new(0),
            models: RwLock::new(models),
            outbound,
            cancel,
        }
    }

    /// Enqueue a frame on the outbound mailbox.
    ///
    /// Fails when the session has already torn down (mailbox closed).
    pub async fn send(&self, frame: Frame) -> Result<(), WorkerGone> {
        self.outbound.send(frame).await.map_err(|_| WorkerGone)
    }

    /// Trigger session teardown: the writer, keepalive, and reader tasks all
    /// watch this signal.
    pub fn shutdown(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub async fn status(&self) -> WorkerStatus {
        *self.status.read().await
    }

    pub async fn set_status(&self, status: WorkerStatus) {
        *self.status.write().await = status;
    }

    pub fn latency_ms(&self) -> i64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn set_latency_ms(&self, latency: i64) {
        self.latency_ms.store(latency, Ordering::Relaxed);
    }

    /// Replace the advertised model list (prices already clamped by the
    /// caller).
    pub async fn set_models(&self, models: Vec<Model>) {
        *self.models.write().await = models;
    }

    pub async fn models(&self) -> Vec<Model> {
        self.models.read().await.clone()
    }

    /// The advertised entry for `model`, if any — used to snapshot prices at
    /// dispatch time.
    pub async fn advertised(&self, model: &str) -> Option<Model> {
        self.models.read().await.iter().find(|m| m.name == model).cloned()
    }

    /// Maximum concurrent requests for min-conn balancing.
    pub fn max_parallel(&self) -> u32 {
        self.engine.num_parallel.max(1)
    }

    /// Whether this worker may still receive dispatches: session alive and
    /// status online.
    pub async fn is_alive(&self) -> bool {
        !self.outbound.is_closed() && *self.status.read().await == WorkerStatus::Online
    }
}

/// The worker's session has terminated; its mailbox no longer accepts frames.
#[derive(Debug, thiserror::Error)]
#[error("worker session has terminated")]
pub struct WorkerGone;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::*;

    /// A live worker plus the receiving end of its mailbox, for tests that
    /// want to observe dispatched frames.
    pub async fn online_worker(
        id: &str,
        user_id: &str,
        models: Vec<Model>,
        num_parallel: u32,
    ) -> (Arc<Worker>, mpsc::Receiver<Frame>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (cancel_tx, _) = watch::channel(false);
        let worker = Worker::new(
            id.to_owned(),
            user_id.to_owned(),
            "127.0.0.1:0".to_owned(),
            EngineInfo { name: "ollama".into(), num_parallel },
            models,
            out_tx,
            cancel_tx,
        );
        worker.set_status(WorkerStatus::Online).await;
        (Arc::new(worker), out_rx)
    }
}

#[cfg(test)]
mod tests {
    use ember_proto::FrameKind;

    use super::*;

    #[tokio::test]
    async fn send_fails_after_teardown() {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (cancel_tx, _) = watch::channel(false);
        let worker = Worker::new(
            "w1".into(),
            "u1".into(),
            "127.0.0.1:1".into(),
            EngineInfo::default(),
            Vec::new(),
            out_tx,
            cancel_tx,
        );
        drop(out_rx);
        assert!(worker.send(Frame::close(None)).await.is_err());
        assert!(!worker.is_alive().await);
    }

    #[tokio::test]
    async fn advertised_snapshot_is_independent_of_later_updates() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (cancel_tx, _) = watch::channel(false);
        let worker = Worker::new(
            "w1".into(),
            "u1".into(),
            "127.0.0.1:1".into(),
            EngineInfo::default(),
            vec![Model {
                name: "m".into(),
                engine: "ollama".into(),
                kind: Default::default(),
                size: String::new(),
                quantization: String::new(),
                ippm: 4.0,
                oppm: 8.0,
            }],
            out_tx,
            cancel_tx,
        );

        let snapshot = worker.advertised("m").await.expect("advertised");
        assert_eq!(snapshot.ippm, 4.0);

        // A price push after the snapshot must not affect it.
        let mut updated = snapshot.clone();
        updated.ippm = 9.0;
        worker.set_models(vec![updated]).await;
        assert_eq!(snapshot.ippm, 4.0);

        worker.send(Frame::close(None)).await.expect("send");
        let frame = out_rx.recv().await.expect("frame");
        assert_eq!(frame.kind, FrameKind::Close);
    }
}
