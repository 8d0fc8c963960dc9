//! OpenAI-compatible chat-completion route.
//!
//! Thin shell over [`crate::dispatch::chat::handle_chat`]: extract identity
//! and origin, hand the parsed body to the dispatcher.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::post;
use axum::{Extension, Json, Router};
use utoipa::OpenApi;

use crate::auth::AuthUser;
use crate::dispatch::{chat, RequestMeta};
use crate::error::ServerError;
use crate::schemas::v1::{ChatCompletionRequest, ChatMessage};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(chat_completions), components(schemas(ChatCompletionRequest, ChatMessage)))]
pub struct ChatApi;

pub fn router() -> Router<AppState> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// OpenAI chat completions (`POST /v1/chat/completions`).
///
/// The request is matched to a worker advertising the model, relayed over
/// the worker's response channel, and billed against the prices advertised
/// at dispatch time.  `stream: true` yields SSE.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion (JSON) or SSE stream"),
        (status = 400, description = "Malformed request or no available client"),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "Worker failure or timeout"),
    )
)]
pub async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ServerError> {
    let meta = RequestMeta {
        user_id: auth.user_id,
        api_key_id: auth.api_key_id,
        remote_addr: addr.to_string(),
    };
    chat::handle_chat(state, meta, request).await
}
