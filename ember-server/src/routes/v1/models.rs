//! OpenAI-compatible models listing.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::{ModelInfo, ModelListResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models), components(schemas(ModelListResponse, ModelInfo)))]
pub struct ModelsApi;

pub fn router() -> Router<AppState> {
    Router::new().route("/models", get(list_models))
}

/// OpenAI model list (`GET /v1/models`), deduplicated by model name.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses((status = 200, description = "Available models", body = ModelListResponse))
)]
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelListResponse>, ServerError> {
    let models = state.models.openai_view(state.config.max_latency_ms).await;
    let data = models
        .into_iter()
        .map(|m| ModelInfo {
            id: m.name,
            object: "model".into(),
            created: chrono::Utc::now().timestamp(),
            owned_by: m.engine,
        })
        .collect();
    Ok(Json(ModelListResponse { object: "list".into(), data }))
}
