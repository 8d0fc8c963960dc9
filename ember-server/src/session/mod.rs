//! The per-worker session: owner of the control WebSocket.
//!
//! A session comes to life after the registration handshake (token already
//! validated by the HTTP handler) and runs three cooperating tasks:
//!
//! - the **outbound writer**, sole owner of the WebSocket sink, draining the
//!   worker's bounded mailbox — every other part of the broker talks to the
//!   worker by enqueueing frames, never by touching the socket;
//! - the **keepalive ticker**, pinging every `KEEPALIVE_TIME` seconds and
//!   folding pong data (latency, refreshed models) back into the worker
//!   handle — the reader never mutates latency directly, keeping each field
//!   single-writer;
//! - the **inbound reader** (the session task itself), demultiplexing
//!   control frames.
//!
//! Teardown from any of the three cascades through a `watch` signal; the
//! session then purges the worker from the model registry so no dispatcher
//! can select it again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ember_proto::{Frame, FrameKind, Model, PingPong, PingPongKind, RegisterInfo};

use crate::db::{TrendStore, WorkerRecord, WorkerStore};
use crate::registry::worker::{Worker, WorkerStatus};
use crate::state::AppState;

/// How long a freshly upgraded socket may take to send its `REGISTER` frame.
const REGISTER_DEADLINE: Duration = Duration::from_secs(10);

/// Malformed control frames tolerated before the session is closed.
const MAX_PROTOCOL_STRIKES: u32 = 8;

/// Outbound mailbox depth per worker.
const MAILBOX_DEPTH: usize = 64;

/// Drive one worker connection to completion.  Runs inside the WebSocket
/// upgrade callback for `GET /register/{worker_id}`.
pub async fn run(state: AppState, socket: WebSocket, worker_id: String, user_id: String, addr: SocketAddr) {
    let (ws_tx, mut ws_rx) = socket.split();

    // ── Registration handshake ───────────────────────────────────────────────
    let register = match tokio::time::timeout(REGISTER_DEADLINE, read_frame(&mut ws_rx)).await {
        Ok(Some(frame)) if frame.kind == FrameKind::Register => frame,
        Ok(Some(frame)) => {
            warn!(worker_id = %worker_id, kind = ?frame.kind, "expected REGISTER as first frame; closing");
            return;
        }
        Ok(None) => {
            warn!(worker_id = %worker_id, "connection closed before REGISTER");
            return;
        }
        Err(_) => {
            warn!(worker_id = %worker_id, "REGISTER deadline elapsed; closing");
            return;
        }
    };

    let info: RegisterInfo = match register.content_as() {
        Ok(info) => info,
        Err(e) => {
            warn!(worker_id = %worker_id, error = %e, "malformed REGISTER payload; closing");
            return;
        }
    };

    let models = clamp_models(info.models, state.config.ippm_max, state.config.oppm_max);
    let (out_tx, out_rx) = mpsc::channel::<Frame>(MAILBOX_DEPTH);
    let (cancel_tx, _) = watch::channel(false);
    let worker = Arc::new(Worker::new(
        worker_id.clone(),
        user_id.clone(),
        addr.to_string(),
        info.engine,
        models.clone(),
        out_tx,
        cancel_tx,
    ));
    worker.set_status(WorkerStatus::Online).await;

    for model in &models {
        state.models.register(&model.name, &worker).await;
    }
    info!(
        worker_id = %worker.id,
        user_id = %worker.user_id,
        remote_addr = %addr,
        models = models.len(),
        "worker registered"
    );

    // Ownership row and marketplace event, off the session path.
    {
        let state = state.clone();
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            let record = WorkerRecord {
                id: worker.id.clone(),
                user_id: worker.user_id.clone(),
                remote_addr: worker.remote_addr.clone(),
                engine: worker.engine.name.clone(),
                num_parallel: i64::from(worker.engine.num_parallel),
                registered_at: worker.register_time,
                last_seen: Utc::now(),
            };
            if let Err(e) = state.store.upsert_worker(record).await {
                warn!(worker_id = %worker.id, error = %e, "failed to persist worker row");
            }
            let description = format!("worker {} joined from {}", worker.id, worker.remote_addr);
            if let Err(e) = state
                .store
                .record_trend("worker joined", &description, Some(&worker.user_id), Some(&worker.id))
                .await
            {
                warn!(worker_id = %worker.id, error = %e, "failed to record join trend");
            }
        });
    }

    // ── Outbound writer ──────────────────────────────────────────────────────
    let writer = tokio::spawn(write_loop(ws_tx, out_rx, worker.cancelled()));

    // ── Keepalive ticker ─────────────────────────────────────────────────────
    let (pong_tx, pong_rx) = mpsc::channel::<PingPong>(8);
    let keepalive = tokio::spawn(keepalive_loop(state.clone(), Arc::clone(&worker), pong_rx));

    // ── Inbound reader (this task) ───────────────────────────────────────────
    read_loop(&state, &worker, &mut ws_rx, pong_tx).await;

    // ── Teardown ─────────────────────────────────────────────────────────────
    worker.set_status(WorkerStatus::Offline).await;
    worker.shutdown();
    state.models.deregister_worker(&worker.id).await;
    info!(worker_id = %worker.id, "worker session ended");

    {
        let state = state.clone();
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            let description = format!("worker {} left", worker.id);
            if let Err(e) = state
                .store
                .record_trend("worker left", &description, Some(&worker.user_id), Some(&worker.id))
                .await
            {
                warn!(worker_id = %worker.id, error = %e, "failed to record leave trend");
            }
        });
    }

    let _ = keepalive.await;
    let _ = writer.await;
}

/// Clamp worker-advertised prices into the operator-configured bounds.
pub fn clamp_models(models: Vec<Model>, ippm_max: f64, oppm_max: f64) -> Vec<Model> {
    models
        .into_iter()
        .map(|mut m| {
            m.ippm = m.ippm.clamp(0.0, ippm_max);
            m.oppm = m.oppm.clamp(0.0, oppm_max);
            m
        })
        .collect()
}

// ── Writer ───────────────────────────────────────────────────────────────────

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox: mpsc::Receiver<Frame>,
    mut cancelled: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = mailbox.recv() => {
                let Some(frame) = maybe else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound frame; dropping");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "control socket write failed");
                    break;
                }
            }
            _ = cancelled.changed() => break,
        }
    }
    let _ = sink.close().await;
}

// ── Keepalive ────────────────────────────────────────────────────────────────

async fn keepalive_loop(state: AppState, worker: Arc<Worker>, mut pongs: mpsc::Receiver<PingPong>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(state.config.keepalive_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cancelled = worker.cancelled();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ping = PingPong::ping(Utc::now().timestamp_millis());
                let content = match serde_json::to_value(&ping) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if worker.send(Frame::new(FrameKind::Keepalive, content)).await.is_err() {
                    break;
                }
            }
            maybe = pongs.recv() => {
                let Some(pong) = maybe else { break };
                let latency = (Utc::now().timestamp_millis() - pong.timestamp).max(0);
                worker.set_latency_ms(latency);
                debug!(worker_id = %worker.id, latency_ms = latency, "pong");

                if latency > state.config.max_latency_ms {
                    warn!(worker_id = %worker.id, latency_ms = latency, "latency above bound; closing session");
                    worker.set_status(WorkerStatus::Offline).await;
                    worker.shutdown();
                    break;
                }

                // A pong refreshes the advertisement wholesale.
                let models = clamp_models(
                    pong.available_models,
                    state.config.ippm_max,
                    state.config.oppm_max,
                );
                worker.set_models(models.clone()).await;
                for model in &models {
                    state.models.register(&model.name, &worker).await;
                }
                worker.set_status(WorkerStatus::Online).await;
            }
            _ = cancelled.changed() => break,
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

async fn read_loop(
    state: &AppState,
    worker: &Arc<Worker>,
    ws_rx: &mut SplitStream<WebSocket>,
    pongs: mpsc::Sender<PingPong>,
) {
    let mut strikes = 0u32;
    let mut cancelled = worker.cancelled();

    loop {
        let frame = tokio::select! {
            frame = next_control_frame(ws_rx, &mut strikes) => frame,
            _ = cancelled.changed() => break,
        };
        let Some(frame) = frame else { break };

        match frame.kind {
            FrameKind::Keepalive => match frame.content_as::<PingPong>() {
                Ok(pong) if pong.kind == PingPongKind::Pong => {
                    // Bounded hand-off: the ticker owns latency and model
                    // mutation, the reader only forwards.
                    let _ = pongs.send(pong).await;
                }
                Ok(_) => debug!(worker_id = %worker.id, "ignoring ping from worker"),
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, "malformed keepalive content");
                    strikes += 1;
                }
            },

            // Steady-state response traffic belongs on the per-request
            // response channel; when it shows up here anyway, route it to
            // whichever dispatcher is waiting on the fingerprint.
            FrameKind::Message
            | FrameKind::MessageStream
            | FrameKind::ModelError
            | FrameKind::EmbeddingResponse => {
                match frame.fingerprint.as_deref().and_then(|fp| Uuid::parse_str(fp).ok()) {
                    Some(fingerprint) => {
                        state.responses.route_control_frame(fingerprint, frame).await;
                    }
                    None => {
                        warn!(worker_id = %worker.id, kind = ?frame.kind, "response frame without fingerprint on control channel");
                        strikes += 1;
                    }
                }
            }

            // A re-register refreshes the advertisement like a pong does.
            FrameKind::Register => match frame.content_as::<RegisterInfo>() {
                Ok(info) => {
                    let models =
                        clamp_models(info.models, state.config.ippm_max, state.config.oppm_max);
                    worker.set_models(models.clone()).await;
                    for model in &models {
                        state.models.register(&model.name, worker).await;
                    }
                }
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, "malformed re-REGISTER payload");
                    strikes += 1;
                }
            },

            FrameKind::Close => {
                info!(worker_id = %worker.id, "worker closed the control channel");
                break;
            }

            other => {
                debug!(worker_id = %worker.id, kind = ?other, "unexpected control frame; dropped");
                strikes += 1;
            }
        }

        if strikes >= MAX_PROTOCOL_STRIKES {
            warn!(worker_id = %worker.id, strikes, "too many protocol violations; closing session");
            break;
        }
    }
}

/// The registration frame, with its own strike counter.
async fn read_frame(ws_rx: &mut SplitStream<WebSocket>) -> Option<Frame> {
    let mut strikes = 0;
    next_control_frame(ws_rx, &mut strikes).await
}

/// The next parsed frame off the control socket.
///
/// Returns `None` on transport EOF/error or a close frame; malformed JSON
/// counts a strike and is skipped.
async fn next_control_frame(ws_rx: &mut SplitStream<WebSocket>, strikes: &mut u32) -> Option<Frame> {
    loop {
        match ws_rx.next().await? {
            Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    warn!(error = %e, "malformed control frame; dropping");
                    *strikes += 1;
                    if *strikes >= MAX_PROTOCOL_STRIKES {
                        return None;
                    }
                }
            },
            Ok(Message::Binary(raw)) => match serde_json::from_slice::<Frame>(&raw) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    warn!(error = %e, "malformed binary control frame; dropping");
                    *strikes += 1;
                    if *strikes >= MAX_PROTOCOL_STRIKES {
                        return None;
                    }
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {} // transport ping/pong
            Err(e) => {
                debug!(error = %e, "control socket read failed");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ember_proto::ModelKind;

    use super::*;

    fn model(name: &str, ippm: f64, oppm: f64) -> Model {
        Model {
            name: name.into(),
            engine: "ollama".into(),
            kind: ModelKind::Chat,
            size: String::new(),
            quantization: String::new(),
            ippm,
            oppm,
        }
    }

    #[test]
    fn prices_above_the_cap_are_clamped_on_ingest() {
        let clamped = clamp_models(vec![model("m", 1000.0, 5.0)], 10.0, 10.0);
        assert_eq!(clamped[0].ippm, 10.0);
        assert_eq!(clamped[0].oppm, 5.0);
    }

    #[test]
    fn negative_prices_are_floored_at_zero() {
        let clamped = clamp_models(vec![model("m", -3.0, -0.5)], 10.0, 10.0);
        assert_eq!(clamped[0].ippm, 0.0);
        assert_eq!(clamped[0].oppm, 0.0);
    }
}
