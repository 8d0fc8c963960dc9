//! Worker-facing WebSocket endpoints.
//!
//! - `GET /register/{worker_id}` — the control channel.  The single-use
//!   registration token is validated (and consumed) *before* the 101
//!   upgrade, so an invalid token is a plain 401 and never a dangling
//!   socket.
//! - `GET /response/{fingerprint}` — the per-request response channel.  The
//!   accept handler hands the upgraded socket to whichever dispatcher is
//!   waiting on the fingerprint and exits.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServerError;
use crate::registry::responses::ResponseChannel;
use crate::session;
use crate::state::AppState;

pub async fn register_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let token = headers
        .get(ember_proto::REGISTRATION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest("Registration token is required".into()))?;

    let user_id = state
        .register_tokens
        .consume(token)
        .await
        .map_err(|e| ServerError::Unauthorized(format!("Invalid registration token: {e}")))?;

    info!(worker_id = %worker_id, user_id = %user_id, remote_addr = %addr, "worker control channel accepted");
    let buffer = state.config.ws_buffer;
    Ok(ws
        .max_message_size(buffer)
        .max_frame_size(buffer)
        .on_upgrade(move |socket| session::run(state, socket, worker_id, user_id, addr)))
}

pub async fn response_channel(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let fingerprint = Uuid::parse_str(&fingerprint)
        .map_err(|_| ServerError::BadRequest("invalid fingerprint".into()))?;

    let buffer = state.config.ws_buffer;
    Ok(ws
        .max_message_size(buffer)
        .max_frame_size(buffer)
        .on_upgrade(move |socket| async move {
            // Short-lived: handshake, hand off, done.  The dispatcher owns
            // the socket from here.
            if state
                .responses
                .attach(fingerprint, ResponseChannel::Socket(socket))
                .await
                .is_err()
            {
                warn!(%fingerprint, "response channel opened with no waiting dispatcher; dropping");
            }
        }))
}
