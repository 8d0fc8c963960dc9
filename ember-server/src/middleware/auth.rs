//! Bearer authentication middleware.
//!
//! Two flavours:
//!
//! - [`jwt_auth`] — account endpoints (`/api/user/…`): the bearer token must
//!   be a JWT issued by `POST /api/login`.
//! - [`auth_required`] — the OpenAI-compatible `/v1` endpoints: the bearer
//!   token may be either a JWT or an `sk-…` API key.  JWTs are recognised by
//!   their two-dot structure, mirroring how SDK clients send either without
//!   distinguishing them.
//!
//! On success the resolved [`AuthUser`] is inserted into request extensions.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::auth::{jwt, keys, AuthUser};
use crate::db::UserStore;
use crate::error::ServerError;
use crate::state::AppState;

fn bearer_token(req: &Request<Body>) -> Result<&str, ServerError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::Unauthorized("Authorization header is required".into()))?;
    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ServerError::Unauthorized("Authorization header format must be Bearer <token>".into()))
}

async fn resolve_jwt(state: &AppState, token: &str) -> Result<AuthUser, ServerError> {
    let claims = jwt::verify(&state.config.jwt_secret, token)
        .map_err(|_| ServerError::Unauthorized("invalid or expired token".into()))?;
    let user = state
        .store
        .user_by_id(&claims.user_id)
        .await?
        .ok_or_else(|| ServerError::Unauthorized("user not found or deleted".into()))?;
    Ok(AuthUser {
        user_id: user.id,
        username: user.username,
        role: user.role,
        api_key_id: None,
    })
}

async fn resolve_api_key(state: &AppState, token: &str) -> Result<AuthUser, ServerError> {
    let key = keys::validate(state.store.as_ref(), token).await?;
    let user = state
        .store
        .user_by_id(&key.user_id)
        .await?
        .ok_or_else(|| ServerError::Unauthorized("user not found or deleted".into()))?;
    Ok(AuthUser {
        user_id: user.id,
        username: user.username,
        role: user.role,
        api_key_id: Some(key.id),
    })
}

/// Require a valid user JWT.
pub async fn jwt_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let auth = match bearer_token(&req) {
        Ok(token) => resolve_jwt(&state, token).await,
        Err(e) => Err(e),
    };
    match auth {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

/// Accept either a user JWT or an API key.
pub async fn auth_required(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let auth = match bearer_token(&req) {
        Ok(token) => {
            // A JWT has exactly two dots; anything else is treated as an
            // API key.
            if token.matches('.').count() == 2 {
                resolve_jwt(&state, token).await
            } else {
                resolve_api_key(&state, token).await
            }
        }
        Err(e) => Err(e),
    };
    match auth {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}
