//! The dispatcher: one consumer request, end to end.
//!
//! Sequence for every request, chat or embedding:
//!
//! 1. prune + balance to pick a worker;
//! 2. snapshot the advertised `(ippm, oppm)` *now* — later price pushes must
//!    not change what this request is billed at;
//! 3. save the fingerprint (`preparing`) so concurrent min-conn decisions
//!    see this request;
//! 4. register the response-channel readiness handle, then enqueue the
//!    dispatch frame on the worker's mailbox;
//! 5. await the readiness handle (bounded by `CHAT_MAX_TIME`), relay the
//!    response, meter usage, and push income back to the worker.
//!
//! The relay functions live in [`chat`] and [`embedding`]; [`income`] owns
//! metering and the `INCOME` control-channel push.

pub mod chat;
pub mod embedding;
pub mod income;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use ember_proto::{Frame, FrameKind};

use crate::db::FingerprintStore;
use crate::error::ServerError;
use crate::registry::responses::ResponseChannel;
use crate::registry::worker::Worker;
use crate::state::AppState;

/// Caller identity and origin, carried into the usage ledger.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub remote_addr: String,
}

/// One dispatched request: the chosen worker plus everything snapshotted at
/// dispatch time.
pub struct Dispatch {
    pub fingerprint: Uuid,
    pub worker: Arc<Worker>,
    pub model: String,
    /// Input price per million tokens, frozen at dispatch.
    pub ippm: f64,
    /// Output price per million tokens, frozen at dispatch.
    pub oppm: f64,
    /// Hard deadline for the whole request.
    pub deadline: Instant,
}

/// Steps 1–4: balance, snapshot, save, enqueue.
///
/// On success the caller owns the readiness handle and *must* drive the
/// request to a terminal state (the relay loops do).
pub async fn begin(
    state: &AppState,
    model: &str,
    kind: FrameKind,
    content: Value,
) -> Result<(Dispatch, oneshot::Receiver<ResponseChannel>), ServerError> {
    let candidates = state.models.candidates(model, state.config.max_latency_ms).await;
    let worker = state
        .balancer
        .select(model, &candidates, &state.fingerprints)
        .await
        .ok_or(ServerError::NoAvailableClient)?;

    // Price freeze: the advertised entry as of *this instant*.
    let advertised = worker
        .advertised(model)
        .await
        .ok_or(ServerError::NoAvailableClient)?;

    let fingerprint = Uuid::new_v4();
    state.fingerprints.save(fingerprint, &worker.id).await;
    mirror_fingerprint(state, fingerprint, &worker.id, "preparing");

    let ready = state.responses.expect(fingerprint).await;

    let frame = Frame::with_fingerprint(kind, content, fingerprint.to_string());
    if worker.send(frame).await.is_err() {
        state.responses.abandon(fingerprint).await;
        complete(state, fingerprint, &worker.id).await;
        return Err(ServerError::Internal("worker went away during dispatch".into()));
    }

    let deadline = Instant::now() + std::time::Duration::from_secs(state.config.chat_max_secs);
    Ok((
        Dispatch {
            fingerprint,
            worker,
            model: model.to_owned(),
            ippm: advertised.ippm,
            oppm: advertised.oppm,
            deadline,
        },
        ready,
    ))
}

/// Step 5a: wait for the worker to open the response channel.
pub async fn await_channel(
    state: &AppState,
    dispatch: &Dispatch,
    ready: oneshot::Receiver<ResponseChannel>,
) -> Result<ResponseChannel, ServerError> {
    match tokio::time::timeout_at(dispatch.deadline, ready).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(_)) => {
            // Readiness sender dropped without attaching: router state was
            // torn down underneath us.
            complete(state, dispatch.fingerprint, &dispatch.worker.id).await;
            Err(ServerError::Internal("response channel closed before opening".into()))
        }
        Err(_) => {
            state.responses.abandon(dispatch.fingerprint).await;
            complete(state, dispatch.fingerprint, &dispatch.worker.id).await;
            Err(ServerError::ChatTimeout)
        }
    }
}

/// Terminal bookkeeping shared by every exit path.
pub async fn complete(state: &AppState, fingerprint: Uuid, worker_id: &str) {
    state.fingerprints.complete(fingerprint).await;
    mirror_fingerprint(state, fingerprint, worker_id, "completed");
}

/// Mark the fingerprint transmitting (first response frame observed).
pub async fn transmitting(state: &AppState, fingerprint: Uuid, worker_id: &str) {
    state.fingerprints.set_transmitting(fingerprint).await;
    mirror_fingerprint(state, fingerprint, worker_id, "transmitting");
}

/// Write-through of a fingerprint state to the store, off the relay path.
fn mirror_fingerprint(state: &AppState, fingerprint: Uuid, worker_id: &str, fp_state: &'static str) {
    let store = Arc::clone(&state.store);
    let worker_id = worker_id.to_owned();
    tokio::spawn(async move {
        if let Err(e) = store
            .record_fingerprint(&fingerprint.to_string(), &worker_id, fp_state)
            .await
        {
            warn!(%fingerprint, error = %e, "failed to mirror fingerprint state");
        }
    });
}
