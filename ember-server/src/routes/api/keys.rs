//! API key CRUD for the authenticated user.

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use serde_json::json;

use crate::auth::{keys, AuthUser};
use crate::db::ApiKeyStore;
use crate::error::ServerError;
use crate::schemas::api::{ApiKeyView, CreateKeyRequest, RenameKeyRequest};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/keys", get(list).post(create))
        .route("/keys/{id}", put(rename).delete(revoke))
}

/// `POST /api/user/keys` — mint a key; the secret appears only in this
/// response.
pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Json<ApiKeyView>, ServerError> {
    let live = state
        .store
        .keys_by_user(&auth.user_id)
        .await?
        .into_iter()
        .filter(|k| !k.revoked)
        .count();
    if live >= state.config.max_api_keys_per_user {
        return Err(ServerError::BadRequest(format!(
            "maximum number of API keys reached ({})",
            state.config.max_api_keys_per_user
        )));
    }

    let expiry_days = request
        .expiry_days
        .unwrap_or(state.config.default_key_expiry_days)
        .max(1);
    let record = keys::mint(&auth.user_id, &request.name, expiry_days);
    state.store.insert_key(record.clone()).await?;

    Ok(Json(ApiKeyView::fresh(record)))
}

/// `GET /api/user/keys` — list the caller's keys, secrets blanked.
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<ApiKeyView>>, ServerError> {
    let records = state.store.keys_by_user(&auth.user_id).await?;
    Ok(Json(records.into_iter().map(ApiKeyView::redacted).collect()))
}

/// `PUT /api/user/keys/{id}` — rename a key.
pub async fn rename(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(key_id): Path<String>,
    Json(request): Json<RenameKeyRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if !state.store.rename_key(&auth.user_id, &key_id, &request.name).await? {
        return Err(ServerError::NotFound("API key not found".into()));
    }
    Ok(Json(json!({ "message": "key renamed" })))
}

/// `DELETE /api/user/keys/{id}` — revoke a key.
pub async fn revoke(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(key_id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if !state.store.revoke_key(&auth.user_id, &key_id).await? {
        return Err(ServerError::NotFound("API key not found".into()));
    }
    Ok(Json(json!({ "message": "key revoked" })))
}
