//! Chat-completion dispatch: unary and SSE relays.

use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use ember_proto::{FrameKind, UsageTally};

use crate::error::ServerError;
use crate::registry::responses::ResponseChannel;
use crate::schemas::v1::ChatCompletionRequest;
use crate::state::AppState;

use super::{income, Dispatch, RequestMeta};

/// `POST /v1/chat/completions`, after auth and body parsing.
pub async fn handle_chat(
    state: AppState,
    meta: RequestMeta,
    request: ChatCompletionRequest,
) -> Result<Response, ServerError> {
    if request.model.is_empty() {
        return Err(ServerError::BadRequest("model is required".into()));
    }
    if request.messages.is_empty() {
        return Err(ServerError::BadRequest("messages must not be empty".into()));
    }

    let streaming = request.stream;
    let content = serde_json::to_value(&request)
        .map_err(|e| ServerError::Internal(format!("failed to re-encode request: {e}")))?;

    let (dispatch, ready) = super::begin(&state, &request.model, FrameKind::Message, content).await?;
    debug!(
        fingerprint = %dispatch.fingerprint,
        worker_id = %dispatch.worker.id,
        model = %dispatch.model,
        streaming,
        "chat dispatched"
    );

    let channel = super::await_channel(&state, &dispatch, ready).await?;

    if streaming {
        Ok(stream_response(state, dispatch, meta, channel))
    } else {
        unary_relay(state, dispatch, meta, channel).await
    }
}

// ── Unary ────────────────────────────────────────────────────────────────────

async fn unary_relay(
    state: AppState,
    dispatch: Dispatch,
    meta: RequestMeta,
    mut channel: ResponseChannel,
) -> Result<Response, ServerError> {
    let mut first = true;
    loop {
        let frame = match tokio::time::timeout_at(dispatch.deadline, channel.next_frame()).await {
            Err(_) => {
                super::complete(&state, dispatch.fingerprint, &dispatch.worker.id).await;
                return Err(ServerError::ChatTimeout);
            }
            Ok(None) => {
                super::complete(&state, dispatch.fingerprint, &dispatch.worker.id).await;
                return Err(ServerError::Internal("worker closed the response channel".into()));
            }
            Ok(Some(frame)) => frame,
        };
        if std::mem::take(&mut first) {
            super::transmitting(&state, dispatch.fingerprint, &dispatch.worker.id).await;
        }

        match frame.kind {
            FrameKind::Message => {
                let tally = harvest_usage(&frame.content).unwrap_or_default();
                income::meter(&state, &dispatch, &meta, tally, "chat");
                super::complete(&state, dispatch.fingerprint, &dispatch.worker.id).await;
                return Ok(Json(frame.content).into_response());
            }
            FrameKind::ModelError => {
                super::complete(&state, dispatch.fingerprint, &dispatch.worker.id).await;
                return Err(ServerError::ModelError(error_text(&frame.content)));
            }
            FrameKind::Close => {
                super::complete(&state, dispatch.fingerprint, &dispatch.worker.id).await;
                return Err(ServerError::Internal("worker closed before responding".into()));
            }
            // An engine that streams internally may leak chunks even for a
            // unary request; only the final MESSAGE matters here.
            FrameKind::MessageStream => {
                debug!(fingerprint = %dispatch.fingerprint, "stream chunk in unary relay; skipping");
            }
            other => {
                warn!(fingerprint = %dispatch.fingerprint, kind = ?other, "unexpected frame in unary relay");
                super::complete(&state, dispatch.fingerprint, &dispatch.worker.id).await;
                return Err(ServerError::Internal(format!("unexpected frame type: {other:?}")));
            }
        }
    }
}

// ── Streaming ────────────────────────────────────────────────────────────────

fn stream_response(
    state: AppState,
    dispatch: Dispatch,
    meta: RequestMeta,
    channel: ResponseChannel,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
    tokio::spawn(stream_relay(state, dispatch, meta, channel, tx));

    let mut response = Sse::new(ReceiverStream::new(rx)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));
    response
}

/// Forward worker stream frames to the consumer as `data: <json>\n\n`
/// events, close with `data: [DONE]\n\n` iff a usage tally arrived, then
/// meter.
async fn stream_relay(
    state: AppState,
    dispatch: Dispatch,
    meta: RequestMeta,
    mut channel: ResponseChannel,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    let mut usage: Option<UsageTally> = None;
    // `finish_reason == "stop"` seen, but no usage yet: some providers send
    // the tally in a trailing chunk.
    let mut finished = false;
    let mut consumer_gone = false;
    let mut first = true;

    loop {
        let frame = match tokio::time::timeout_at(dispatch.deadline, channel.next_frame()).await {
            Err(_) => {
                debug!(fingerprint = %dispatch.fingerprint, "stream deadline elapsed");
                break;
            }
            Ok(None) => break,
            Ok(Some(frame)) => frame,
        };
        if std::mem::take(&mut first) {
            super::transmitting(&state, dispatch.fingerprint, &dispatch.worker.id).await;
        }

        match frame.kind {
            FrameKind::MessageStream | FrameKind::Message => {
                let tally = harvest_usage(&frame.content);
                // After the stop chunk, a usage-only chunk is a trailer for
                // accounting, not consumer-visible output.
                let trailer = finished && tally.is_some();
                if !trailer
                    && tx
                        .send(Ok(Event::default().data(frame.content.to_string())))
                        .await
                        .is_err()
                {
                    consumer_gone = true;
                    break;
                }
                if let Some(tally) = tally {
                    usage = Some(tally);
                    let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
                    break;
                }
                if finish_reason_is_stop(&frame.content) {
                    finished = true;
                }
            }
            FrameKind::ModelError => {
                let message = error_text(&frame.content);
                warn!(fingerprint = %dispatch.fingerprint, %message, "model error mid-stream");
                let _ = tx
                    .send(Ok(Event::default().data(
                        serde_json::json!({ "error": format!("Model error: {message}") }).to_string(),
                    )))
                    .await;
                break;
            }
            FrameKind::Close => break,
            other => {
                warn!(fingerprint = %dispatch.fingerprint, kind = ?other, "unexpected frame in stream relay");
                break;
            }
        }
    }

    super::complete(&state, dispatch.fingerprint, &dispatch.worker.id).await;

    // A consumer that disconnected before any usage arrived is not billed;
    // every other termination records what we know (possibly a zero tally).
    if consumer_gone && usage.is_none() {
        debug!(fingerprint = %dispatch.fingerprint, "consumer disconnected; skipping usage metering");
        return;
    }
    income::meter(&state, &dispatch, &meta, usage.unwrap_or_default(), "chat");
}

// ── Payload helpers ──────────────────────────────────────────────────────────

/// A non-empty `usage` object in an OpenAI-shaped payload.
///
/// `"usage": null` (emitted on every pre-final chunk when
/// `stream_options.include_usage` is set) and all-zero tallies are treated
/// as absent.
pub(super) fn harvest_usage(content: &Value) -> Option<UsageTally> {
    let usage = content.get("usage")?;
    if usage.is_null() {
        return None;
    }
    let tally: UsageTally = serde_json::from_value(usage.clone()).ok()?;
    (!tally.is_empty()).then_some(tally)
}

pub(super) fn finish_reason_is_stop(content: &Value) -> bool {
    content
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
        == Some("stop")
}

pub(super) fn error_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_null_is_absent() {
        let chunk = serde_json::json!({"choices": [], "usage": null});
        assert!(harvest_usage(&chunk).is_none());
    }

    #[test]
    fn zero_usage_is_absent() {
        let chunk = serde_json::json!({"usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}});
        assert!(harvest_usage(&chunk).is_none());
    }

    #[test]
    fn usage_tally_is_harvested() {
        let chunk = serde_json::json!({"usage": {"prompt_tokens": 5, "completion_tokens": 15, "total_tokens": 20}});
        let tally = harvest_usage(&chunk).expect("tally");
        assert_eq!(tally.total_tokens, 20);
    }

    #[test]
    fn finish_reason_detection() {
        let stop = serde_json::json!({"choices": [{"finish_reason": "stop", "delta": {}}]});
        let going = serde_json::json!({"choices": [{"finish_reason": null, "delta": {"content": "hi"}}]});
        assert!(finish_reason_is_stop(&stop));
        assert!(!finish_reason_is_stop(&going));
        assert!(!finish_reason_is_stop(&serde_json::json!({})));
    }
}
