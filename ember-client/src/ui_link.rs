//! Local UI side channel.
//!
//! A co-located UI process (tray app, dashboard, …) connects to a local TCP
//! socket.  Messages are 4-byte big-endian length-prefixed UTF-8 JSON:
//!
//! - worker → UI: `{"type": "income", …}` — forwarded `INCOME` notices;
//! - UI → worker: `{"type": "model_prices", "data": [{"name", "ippm",
//!   "oppm"}]}` — price overrides applied to every later advertisement.
//!
//! Income notices are buffered (bounded, oldest dropped) while no UI is
//! connected, so a UI that attaches late still sees earnings.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engines::PriceTable;

/// Largest accepted UI frame.
const MAX_FRAME: u32 = 1024 * 1024;

/// Income notices kept while no UI is attached.
const BACKLOG_DEPTH: usize = 256;

#[derive(Debug, Deserialize)]
struct UiInbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<PriceUpdate>,
}

#[derive(Debug, Deserialize)]
struct PriceUpdate {
    name: String,
    #[serde(default)]
    ippm: f64,
    #[serde(default)]
    oppm: f64,
}

/// Handle used by the control loop to fan income out to the UI.
#[derive(Clone)]
pub struct UiLink {
    income_tx: Option<mpsc::Sender<Value>>,
}

impl UiLink {
    /// A link that swallows all notifications (`--no-ui`).
    pub fn disabled() -> Self {
        Self { income_tx: None }
    }

    /// Bind the UI socket and run its accept loop in the background.
    pub async fn spawn(addr: &str, prices: Arc<PriceTable>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "UI socket listening");
        let (income_tx, income_rx) = mpsc::channel(64);
        tokio::spawn(accept_loop(listener, income_rx, prices));
        Ok(Self { income_tx: Some(income_tx) })
    }

    /// Queue an income notice for the UI; delivery is guaranteed up to the
    /// backlog bound.
    pub async fn notify_income(&self, notice: Value) {
        if let Some(tx) = &self.income_tx {
            if tx.send(notice).await.is_err() {
                warn!("UI link task gone; dropping income notice");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut income_rx: mpsc::Receiver<Value>,
    prices: Arc<PriceTable>,
) {
    let mut backlog: VecDeque<Value> = VecDeque::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "UI connected");
                        serve_ui(stream, &mut backlog, &mut income_rx, Arc::clone(&prices)).await;
                        debug!(%peer, "UI disconnected");
                    }
                    Err(e) => warn!(error = %e, "UI accept failed"),
                }
            }
            maybe = income_rx.recv() => {
                match maybe {
                    Some(notice) => push_backlog(&mut backlog, notice),
                    None => return,
                }
            }
        }
    }
}

fn push_backlog(backlog: &mut VecDeque<Value>, notice: Value) {
    if backlog.len() >= BACKLOG_DEPTH {
        backlog.pop_front();
    }
    backlog.push_back(notice);
}

/// Drive one connected UI until it drops.
///
/// The read half gets its own task (length-prefixed reads are not
/// cancellation-safe inside a `select!`); this function owns the write half.
async fn serve_ui(
    stream: TcpStream,
    backlog: &mut VecDeque<Value>,
    income_rx: &mut mpsc::Receiver<Value>,
    prices: Arc<PriceTable>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let mut reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(value) => handle_inbound(value, &prices).await,
                Err(e) => {
                    debug!(error = %e, "UI read ended");
                    return;
                }
            }
        }
    });

    // A late-attaching UI first receives everything it missed.
    while let Some(notice) = backlog.pop_front() {
        if let Err(e) = write_frame(&mut writer, &notice).await {
            warn!(error = %e, "UI write failed during backlog flush");
            push_backlog(backlog, notice);
            reader_task.abort();
            return;
        }
    }

    loop {
        tokio::select! {
            maybe = income_rx.recv() => {
                let Some(notice) = maybe else { break };
                if let Err(e) = write_frame(&mut writer, &notice).await {
                    warn!(error = %e, "UI write failed; buffering");
                    push_backlog(backlog, notice);
                    break;
                }
            }
            _ = &mut reader_task => break,
        }
    }
    reader_task.abort();
}

async fn handle_inbound(value: Value, prices: &PriceTable) {
    let parsed: UiInbound = match serde_json::from_value(value) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "malformed UI message; ignoring");
            return;
        }
    };
    match parsed.kind.as_str() {
        "model_prices" => {
            for update in parsed.data {
                debug!(model = %update.name, ippm = update.ippm, oppm = update.oppm, "price update");
                prices.set(&update.name, update.ippm, update.oppm).await;
            }
        }
        other => debug!(kind = other, "unknown UI message type; ignored"),
    }
}

// ── Frame codec (4-byte big-endian length + JSON) ────────────────────────────

pub async fn write_frame<W>(writer: &mut W, value: &Value) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let bytes = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Value>
where
    R: AsyncReadExt + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("UI frame of {len} bytes exceeds the limit"),
        ));
    }
    let mut buffer = vec![0u8; len as usize];
    reader.read_exact(&mut buffer).await?;
    serde_json::from_slice(&buffer)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_codec_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let value = serde_json::json!({"type": "income", "amount": 0.0002});

        write_frame(&mut a, &value).await.expect("write");
        let read = read_frame(&mut b).await.expect("read");
        assert_eq!(read, value);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_FRAME + 1).await.expect("length");
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn length_prefix_is_big_endian() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &serde_json::json!({})).await.expect("write");

        let mut prefix = [0u8; 4];
        b.read_exact(&mut prefix).await.expect("prefix");
        // `{}` is two bytes.
        assert_eq!(prefix, [0, 0, 0, 2]);
    }

    #[test]
    fn backlog_drops_oldest_when_full() {
        let mut backlog = VecDeque::new();
        for i in 0..(BACKLOG_DEPTH + 10) {
            push_backlog(&mut backlog, serde_json::json!({"i": i}));
        }
        assert_eq!(backlog.len(), BACKLOG_DEPTH);
        assert_eq!(backlog.front().and_then(|v| v["i"].as_u64()), Some(10));
    }
}
