//! Response routing: handing each worker-opened response channel to the
//! dispatcher that is waiting for it.
//!
//! The dispatcher calls [`ResponseRouter::expect`] *before* enqueueing the
//! dispatch frame, receiving a one-shot readiness handle.  When the worker
//! opens `/response/{fingerprint}`, the accept handler claims the pending
//! slot and sends the upgraded socket through it — no polling anywhere.
//!
//! Response frames normally never travel on the control channel, but when
//! they do (and in tests) the same readiness slot delivers an in-process
//! frame stream instead of a socket, so the relay loop is agnostic to the
//! transport.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use ember_proto::Frame;

/// The response-side transport for one fingerprint.
pub enum ResponseChannel {
    /// A worker-opened WebSocket (`/response/{fingerprint}`).
    Socket(WebSocket),
    /// Frames forwarded in-process (control-channel fallback and tests).
    Frames(mpsc::Receiver<Frame>),
}

impl std::fmt::Debug for ResponseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseChannel::Socket(_) => f.write_str("ResponseChannel::Socket"),
            ResponseChannel::Frames(_) => f.write_str("ResponseChannel::Frames"),
        }
    }
}

impl ResponseChannel {
    /// The next protocol frame, or `None` on end-of-stream.
    ///
    /// Malformed frames are logged and skipped (protocol errors are local to
    /// a frame, not fatal to the channel); transport errors and close frames
    /// end the stream.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        match self {
            ResponseChannel::Frames(rx) => rx.recv().await,
            ResponseChannel::Socket(socket) => loop {
                match socket.recv().await? {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => return Some(frame),
                        Err(e) => {
                            warn!(error = %e, "malformed response frame; dropping");
                        }
                    },
                    Ok(Message::Binary(raw)) => match serde_json::from_slice::<Frame>(&raw) {
                        Ok(frame) => return Some(frame),
                        Err(e) => {
                            warn!(error = %e, "malformed binary response frame; dropping");
                        }
                    },
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => {} // ping/pong handled by the transport
                    Err(e) => {
                        debug!(error = %e, "response channel transport error");
                        return None;
                    }
                }
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponseRouter {
    /// Dispatchers waiting for their response channel to open.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ResponseChannel>>>,
    /// Control-channel forwarding taps for fingerprints whose response frames
    /// arrive on the worker's control socket.
    control: Mutex<HashMap<Uuid, mpsc::Sender<Frame>>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `fingerprint` and return the readiness handle.
    ///
    /// At most one waiter may exist per fingerprint; a second call replaces
    /// the first (whose receiver then resolves to closed).
    pub async fn expect(&self, fingerprint: Uuid) -> oneshot::Receiver<ResponseChannel> {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().await.insert(fingerprint, tx).is_some() {
            warn!(%fingerprint, "replaced an existing response waiter");
        }
        rx
    }

    /// Deliver `channel` to the waiting dispatcher.
    ///
    /// Fails when nobody is waiting (stale or duplicate open): the caller
    /// should drop the connection.
    pub async fn attach(&self, fingerprint: Uuid, channel: ResponseChannel) -> Result<(), ResponseChannel> {
        let waiter = self.pending.lock().await.remove(&fingerprint);
        match waiter {
            Some(tx) => tx.send(channel),
            None => Err(channel),
        }
    }

    /// Drop the pending slot for `fingerprint` (dispatch failed or timed
    /// out); a late open will then be rejected by [`attach`].
    ///
    /// [`attach`]: ResponseRouter::attach
    pub async fn abandon(&self, fingerprint: Uuid) {
        self.pending.lock().await.remove(&fingerprint);
        self.control.lock().await.remove(&fingerprint);
    }

    /// Route a response-kind frame that arrived on a worker's *control*
    /// channel to the dispatcher waiting on its fingerprint.
    ///
    /// The first such frame claims the pending slot with an in-process frame
    /// stream; later frames are forwarded on it.  Frames with no waiter are
    /// dropped.
    pub async fn route_control_frame(&self, fingerprint: Uuid, frame: Frame) {
        // Fast path: an established control tap.
        {
            let mut taps = self.control.lock().await;
            if let Some(tx) = taps.get(&fingerprint) {
                if tx.send(frame).await.is_err() {
                    taps.remove(&fingerprint);
                }
                return;
            }
        }

        let waiter = self.pending.lock().await.remove(&fingerprint);
        match waiter {
            Some(ready) => {
                let (tx, rx) = mpsc::channel(32);
                if ready.send(ResponseChannel::Frames(rx)).is_err() {
                    debug!(%fingerprint, "dispatcher gone before control frame delivery");
                    return;
                }
                if tx.send(frame).await.is_ok() {
                    self.control.lock().await.insert(fingerprint, tx);
                }
            }
            None => {
                debug!(%fingerprint, "response frame on control channel with no waiter; dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ember_proto::FrameKind;

    use super::*;

    #[tokio::test]
    async fn attach_resolves_the_waiter() {
        let router = ResponseRouter::new();
        let fp = Uuid::new_v4();
        let rx = router.expect(fp).await;

        let (_tx, frames) = mpsc::channel(1);
        router
            .attach(fp, ResponseChannel::Frames(frames))
            .await
            .expect("waiter present");

        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn attach_without_waiter_is_rejected() {
        let router = ResponseRouter::new();
        let (_tx, frames) = mpsc::channel(1);
        let rejected = router
            .attach(Uuid::new_v4(), ResponseChannel::Frames(frames))
            .await;
        assert!(rejected.is_err());
    }

    #[tokio::test]
    async fn attach_is_at_most_once_per_fingerprint() {
        let router = ResponseRouter::new();
        let fp = Uuid::new_v4();
        let _rx = router.expect(fp).await;

        let (_tx1, frames1) = mpsc::channel(1);
        let (_tx2, frames2) = mpsc::channel(1);
        assert!(router.attach(fp, ResponseChannel::Frames(frames1)).await.is_ok());
        assert!(router.attach(fp, ResponseChannel::Frames(frames2)).await.is_err());
    }

    #[tokio::test]
    async fn abandoned_fingerprint_rejects_late_opens() {
        let router = ResponseRouter::new();
        let fp = Uuid::new_v4();
        let _rx = router.expect(fp).await;
        router.abandon(fp).await;

        let (_tx, frames) = mpsc::channel(1);
        assert!(router.attach(fp, ResponseChannel::Frames(frames)).await.is_err());
    }

    #[tokio::test]
    async fn control_frames_reach_the_waiter_in_order() {
        let router = ResponseRouter::new();
        let fp = Uuid::new_v4();
        let rx = router.expect(fp).await;

        router
            .route_control_frame(fp, Frame::with_fingerprint(FrameKind::MessageStream, serde_json::json!({"i": 1}), fp.to_string()))
            .await;
        router
            .route_control_frame(fp, Frame::with_fingerprint(FrameKind::Close, serde_json::Value::Null, fp.to_string()))
            .await;

        let mut channel = rx.await.expect("readiness");
        let first = channel.next_frame().await.expect("first frame");
        assert_eq!(first.kind, FrameKind::MessageStream);
        let second = channel.next_frame().await.expect("second frame");
        assert_eq!(second.kind, FrameKind::Close);
    }
}
