//! Embedding dispatch: always unary.
//!
//! Embeddings have no output tokens: the harvested `usage.total_tokens` is
//! the input-token count and revenue is `input · ippm / 1e6` (the `oppm`
//! component is zero by construction).

use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, warn};

use ember_proto::{FrameKind, UsageTally};

use crate::error::ServerError;
use crate::registry::responses::ResponseChannel;
use crate::schemas::v1::EmbeddingRequest;
use crate::state::AppState;

use super::chat::{error_text, harvest_usage};
use super::{income, RequestMeta};

/// `POST /v1/embeddings`, after auth and body parsing.
pub async fn handle_embedding(
    state: AppState,
    meta: RequestMeta,
    request: EmbeddingRequest,
) -> Result<Response, ServerError> {
    if request.model.is_empty() {
        return Err(ServerError::BadRequest("model is required".into()));
    }
    if request.input.is_null() {
        return Err(ServerError::BadRequest("input is required".into()));
    }

    let content = serde_json::to_value(&request)
        .map_err(|e| ServerError::Internal(format!("failed to re-encode request: {e}")))?;

    let (dispatch, ready) =
        super::begin(&state, &request.model, FrameKind::EmbeddingRequest, content).await?;
    debug!(
        fingerprint = %dispatch.fingerprint,
        worker_id = %dispatch.worker.id,
        model = %dispatch.model,
        "embedding dispatched"
    );

    let mut channel = super::await_channel(&state, &dispatch, ready).await?;

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
            FrameKind::EmbeddingResponse => {
                // total_tokens is the input-token count; there is no output
                // side to an embedding.
                let input_tokens = harvest_usage(&frame.content)
                    .map(|t| {
                        if t.total_tokens > 0 {
                            t.total_tokens
                        } else {
                            t.prompt_tokens
                        }
                    })
                    .unwrap_or(0);
                let tally = UsageTally {
                    prompt_tokens: input_tokens,
                    completion_tokens: 0,
                    total_tokens: input_tokens,
                };
                income::meter(&state, &dispatch, &meta, tally, "embedding");
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
            other => {
                // Non-terminal noise is skipped; the deadline still bounds
                // the wait.
                warn!(fingerprint = %dispatch.fingerprint, kind = ?other, "unexpected frame in embedding relay; skipping");
            }
        }
    }
}
