//! The control-channel client.
//!
//! Dials `/register/{id}` with the join token, registers, then serves the
//! broker: every ping is answered with a pong carrying a freshly listed
//! model set, every dispatch spawns a per-request task that opens its own
//! response channel, `RECONNECT` swaps the stored join token, and `INCOME`
//! fans out to the local UI socket.
//!
//! The control WebSocket has exactly one writer: this loop.  Dispatch
//! replies never touch it.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::RwLock;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use ember_proto::{
    EngineInfo, Frame, FrameKind, PingPong, PingPongKind, RegisterInfo,
    REGISTRATION_TOKEN_HEADER,
};

use crate::channel::ResponseSink;
use crate::config::Config;
use crate::engines::EngineSet;
use crate::error::{EngineError, LinkError};
use crate::ui_link::UiLink;

/// Ceiling for the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
enum DispatchOp {
    Chat,
    Embed,
}

pub struct Controller {
    cfg: Config,
    worker_id: String,
    engines: Arc<EngineSet>,
    ui: UiLink,
    /// Replaced atomically when the broker sends `RECONNECT`.
    join_token: RwLock<String>,
}

impl Controller {
    pub fn new(cfg: Config, worker_id: String, engines: Arc<EngineSet>, ui: UiLink) -> Self {
        let join_token = RwLock::new(cfg.token.clone());
        Self { cfg, worker_id, engines, ui, join_token }
    }

    /// Serve forever, reconnecting with exponential backoff.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            match self.connect_and_serve().await {
                Ok(()) => {
                    info!("broker closed the control channel; reconnecting");
                    attempt = 0;
                }
                Err(e) => {
                    warn!(error = %e, "control channel failed");
                    attempt = attempt.saturating_add(1);
                }
            }
            let delay = backoff(attempt);
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_serve(&self) -> Result<(), LinkError> {
        let url = format!("ws://{}/register/{}", self.cfg.host, self.worker_id);
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(LinkError::WebSocket)?;
        {
            let token = self.join_token.read().await;
            let value = token
                .parse()
                .map_err(|_| LinkError::Closed)?;
            request.headers_mut().insert(REGISTRATION_TOKEN_HEADER, value);
        }

        info!(%url, "dialing broker");
        let (ws, _) = connect_async(request).await?;
        let (mut sink, mut stream) = ws.split();

        // ── Register ─────────────────────────────────────────────────────────
        let models = self.engines.advertised_models().await;
        info!(models = models.len(), "registering");
        let register = RegisterInfo {
            id: self.worker_id.clone(),
            models,
            engine: EngineInfo {
                name: self.cfg.engine.clone(),
                num_parallel: self.cfg.num_parallel,
            },
        };
        let frame = Frame::new(FrameKind::Register, serde_json::to_value(&register)?);
        sink.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;

        // ── Serve ────────────────────────────────────────────────────────────
        while let Some(message) = stream.next().await {
            let frame = match message? {
                Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "malformed frame from broker; dropping");
                        continue;
                    }
                },
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {
                    continue;
                }
            };

            match frame.kind {
                FrameKind::Keepalive => {
                    let Ok(ping) = frame.content_as::<PingPong>() else {
                        warn!("malformed keepalive content");
                        continue;
                    };
                    if ping.kind != PingPongKind::Ping {
                        continue;
                    }
                    // Echo the broker's timestamp; refresh the advertisement.
                    let models = self.engines.advertised_models().await;
                    let pong = PingPong::pong(ping.timestamp, models);
                    let reply = Frame::new(FrameKind::Keepalive, serde_json::to_value(&pong)?);
                    sink.send(Message::Text(serde_json::to_string(&reply)?.into())).await?;
                }

                FrameKind::Message => self.spawn_dispatch(frame, DispatchOp::Chat),
                FrameKind::EmbeddingRequest => self.spawn_dispatch(frame, DispatchOp::Embed),

                FrameKind::Reconnect => {
                    if let Some(token) = frame.content.as_str() {
                        info!("join token replaced by broker");
                        *self.join_token.write().await = token.to_owned();
                    } else {
                        warn!("RECONNECT frame without a token payload");
                    }
                }

                FrameKind::Income => {
                    debug!("income notice received");
                    self.ui.notify_income(frame.content).await;
                }

                FrameKind::Close => {
                    info!("broker sent CLOSE");
                    return Ok(());
                }

                other => debug!(kind = ?other, "unexpected control frame; ignored"),
            }
        }

        Err(LinkError::Closed)
    }

    fn spawn_dispatch(&self, frame: Frame, op: DispatchOp) {
        let Some(fingerprint) = frame.fingerprint.clone() else {
            warn!(kind = ?frame.kind, "dispatch frame without fingerprint; dropping");
            return;
        };
        let host = self.cfg.host.clone();
        let engines = Arc::clone(&self.engines);
        tokio::spawn(async move {
            handle_dispatch(host, engines, fingerprint, frame.content, op).await;
        });
    }
}

/// Serve one dispatched request on its own response channel.
async fn handle_dispatch(
    host: String,
    engines: Arc<EngineSet>,
    fingerprint: String,
    request: serde_json::Value,
    op: DispatchOp,
) {
    let model = request["model"].as_str().unwrap_or_default().to_owned();
    debug!(%fingerprint, %model, ?op, "dispatch received");

    let mut sink = match ResponseSink::open(&host, &fingerprint).await {
        Ok(sink) => sink,
        Err(e) => {
            warn!(%fingerprint, error = %e, "failed to open response channel");
            return;
        }
    };

    let result = match engines.engine_for(&model).await {
        None => Err(EngineError::UnsupportedModel(model.clone())),
        Some(engine) => match op {
            DispatchOp::Chat => engine.chat(&request, &mut sink).await,
            DispatchOp::Embed => engine.embed(&request, &mut sink).await,
        },
    };

    if let Err(e) = result {
        warn!(%fingerprint, %model, error = %e, "engine failed");
        if let Err(send_err) = sink.send_error(e.to_string()).await {
            debug!(%fingerprint, error = %send_err, "could not report engine failure");
        }
    }
    sink.close().await;
}

fn backoff(attempt: u32) -> Duration {
    let exp = attempt.min(6);
    let base = Duration::from_secs(1) * 2u32.pow(exp);
    base.min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(5), Duration::from_secs(32));
        assert_eq!(backoff(100), MAX_BACKOFF);
    }
}
