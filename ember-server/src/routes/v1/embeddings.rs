//! OpenAI-compatible embeddings route.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::post;
use axum::{Extension, Json, Router};
use utoipa::OpenApi;

use crate::auth::AuthUser;
use crate::dispatch::{embedding, RequestMeta};
use crate::error::ServerError;
use crate::schemas::v1::EmbeddingRequest;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(embeddings), components(schemas(EmbeddingRequest)))]
pub struct EmbeddingsApi;

pub fn router() -> Router<AppState> {
    Router::new().route("/embeddings", post(embeddings))
}

/// OpenAI embeddings (`POST /v1/embeddings`).
#[utoipa::path(
    post,
    path = "/v1/embeddings",
    tag = "embeddings",
    request_body = EmbeddingRequest,
    responses(
        (status = 200, description = "Embedding vectors"),
        (status = 400, description = "Malformed request or no available client"),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "Worker failure or timeout"),
    )
)]
pub async fn embeddings(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<EmbeddingRequest>,
) -> Result<Response, ServerError> {
    let meta = RequestMeta {
        user_id: auth.user_id,
        api_key_id: auth.api_key_id,
        remote_addr: addr.to_string(),
    };
    embedding::handle_embedding(state, meta, request).await
}
