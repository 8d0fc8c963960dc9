//! Worker join tokens.

use axum::extract::State;
use axum::routing::post;
use axum::{Extension, Json, Router};

use crate::auth::AuthUser;
use crate::error::ServerError;
use crate::schemas::api::RegisterTokenResponse;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/register-token", post(register_token))
}

/// `POST /api/user/register-token` — mint a single-use worker join token
/// bound to the calling account.
pub async fn register_token(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<RegisterTokenResponse>, ServerError> {
    let token = state.register_tokens.issue(&auth.user_id).await;
    Ok(Json(RegisterTokenResponse {
        token,
        expires_in: state.config.register_token_expiry_secs,
    }))
}
