//! OpenAI-compatible `/v1` routes.

pub mod chat;
pub mod embeddings;
pub mod models;

use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(chat::router())
        .merge(embeddings::router())
        .merge(models::router())
}
