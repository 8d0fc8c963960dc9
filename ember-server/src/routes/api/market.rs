//! Marketplace views: available models and the join/leave trend feed.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::db::TrendStore;
use crate::error::ServerError;
use crate::registry::models::MarketplaceModel;
use crate::schemas::api::{TrendsQuery, TrendsResponse};
use crate::state::AppState;

use super::usage::resolve_window;
use crate::schemas::api::WindowQuery;

#[derive(OpenApi)]
#[openapi(paths(market_models, market_trends), components(schemas(TrendsResponse)))]
pub struct MarketApi;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/models", get(market_models))
        .route("/trends", get(market_trends))
}

/// `GET /api/market/models` — every live model with per-worker offers,
/// pruned exactly like dispatch-time selection.
#[utoipa::path(
    get,
    path = "/api/market/models",
    tag = "market",
    responses((status = 200, description = "Marketplace model listing"))
)]
pub async fn market_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<MarketplaceModel>>, ServerError> {
    Ok(Json(state.models.marketplace_view(state.config.max_latency_ms).await))
}

/// `GET /api/market/trends?start_date&end_date&page&size` — paginated feed
/// of marketplace events.
#[utoipa::path(
    get,
    path = "/api/market/trends",
    tag = "market",
    params(TrendsQuery),
    responses((status = 200, description = "Paginated trend feed", body = TrendsResponse))
)]
pub async fn market_trends(
    State(state): State<AppState>,
    Query(query): Query<TrendsQuery>,
) -> Result<Json<TrendsResponse>, ServerError> {
    let window = match (&query.start_date, &query.end_date) {
        (None, None) => None,
        _ => Some(resolve_window(&WindowQuery {
            start_date: query.start_date.clone(),
            end_date: query.end_date.clone(),
        })?),
    };

    let (from, to) = match window {
        Some((from, to)) => (Some(from), Some(to)),
        None => (None, None),
    };

    let (data, total) = state.store.list_trends(from, to, query.page, query.size).await?;
    let size = query.size.clamp(1, 200);
    let total_pages = (total + size - 1) / size;
    Ok(Json(TrendsResponse { data, total, page: query.page.max(1), size, total_pages }))
}
