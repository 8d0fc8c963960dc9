//! The worker side of a per-request response channel.
//!
//! One WebSocket per dispatched fingerprint, never shared.  The engine
//! adapter is the sole writer; the broker's dispatcher is the sole reader.

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use ember_proto::{Frame, FrameKind};

use crate::error::LinkError;

pub struct ResponseSink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    fingerprint: String,
}

impl ResponseSink {
    /// Dial `/response/{fingerprint}` on the broker.
    pub async fn open(host: &str, fingerprint: &str) -> Result<Self, LinkError> {
        let url = format!("ws://{host}/response/{fingerprint}");
        debug!(%url, "opening response channel");
        let (ws, _) = connect_async(url.as_str()).await?;
        Ok(Self { ws, fingerprint: fingerprint.to_owned() })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    async fn send(&mut self, frame: Frame) -> Result<(), LinkError> {
        let text = serde_json::to_string(&frame)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// One streamed chunk (`MESSAGE_STREAM`).
    pub async fn send_stream_chunk(&mut self, content: serde_json::Value) -> Result<(), LinkError> {
        self.send(Frame::with_fingerprint(
            FrameKind::MessageStream,
            content,
            self.fingerprint.clone(),
        ))
        .await
    }

    /// A complete unary response (`MESSAGE`).
    pub async fn send_message(&mut self, content: serde_json::Value) -> Result<(), LinkError> {
        self.send(Frame::with_fingerprint(FrameKind::Message, content, self.fingerprint.clone()))
            .await
    }

    /// An embedding result (`EMBEDDING_RESPONSE`).
    pub async fn send_embedding(&mut self, content: serde_json::Value) -> Result<(), LinkError> {
        self.send(Frame::with_fingerprint(
            FrameKind::EmbeddingResponse,
            content,
            self.fingerprint.clone(),
        ))
        .await
    }

    /// Engine failure (`MODEL_ERROR`).
    pub async fn send_error(&mut self, message: impl Into<String>) -> Result<(), LinkError> {
        let fingerprint = self.fingerprint.clone();
        self.send(Frame::model_error(message, fingerprint)).await
    }

    /// Terminal `CLOSE`, then tear the socket down.
    pub async fn close(mut self) {
        let fingerprint = self.fingerprint.clone();
        let _ = self.send(Frame::close(Some(fingerprint))).await;
        let _ = self.ws.close(None).await;
    }
}
