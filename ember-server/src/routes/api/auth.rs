//! Account flows: login, registration, verification codes.

use axum::extract::State;
use axum::{Json, Router};
use axum::routing::post;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::auth::codes::{CodeDelivery, LogDelivery};
use crate::auth::{jwt, password};
use crate::db::{UserRecord, UserStore};
use crate::error::ServerError;
use crate::schemas::api::{LoginRequest, LoginResponse, RegisterUserRequest, SendCodeRequest};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/register", post(register))
        .route("/send-code", post(send_code))
}

/// `POST /api/login` — exchange credentials for a JWT.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ServerError> {
    let user = state
        .store
        .user_by_username(&request.username)
        .await?
        .ok_or_else(|| ServerError::Unauthorized("invalid username or password".into()))?;

    if !password::verify(&request.password, &user.password_hash) {
        return Err(ServerError::Unauthorized("invalid username or password".into()));
    }

    let token = jwt::issue(
        &state.config.jwt_secret,
        &user.id,
        &user.username,
        &user.role,
        state.config.jwt_expiry_hours,
    )
    .map_err(|e| ServerError::Internal(format!("failed to sign token: {e}")))?;

    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// `POST /api/send-code` — issue a verification code for an email address.
pub async fn send_code(
    State(state): State<AppState>,
    Json(request): Json<SendCodeRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if !request.email.contains('@') {
        return Err(ServerError::BadRequest("a valid email address is required".into()));
    }

    let code = state.codes.generate(&request.email).await;
    // Delivery transport is a deployment concern; the default logs the code.
    LogDelivery.deliver(&request.email, &code);

    Ok(Json(json!({ "message": "verification code sent" })))
}

/// `POST /api/register` — create an account after code verification.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterUserRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if request.username.is_empty() || request.password.len() < 6 {
        return Err(ServerError::BadRequest(
            "username and a password of at least 6 characters are required".into(),
        ));
    }

    if !state.codes.verify(&request.email, &request.code).await {
        return Err(ServerError::BadRequest("verification code invalid or expired".into()));
    }

    if state.store.user_by_email(&request.email).await?.is_some() {
        return Err(ServerError::BadRequest("email already registered".into()));
    }
    if state.store.user_by_username(&request.username).await?.is_some() {
        return Err(ServerError::BadRequest("username already taken".into()));
    }

    let password_hash = password::hash(&request.password)
        .map_err(|e| ServerError::Internal(format!("failed to hash password: {e}")))?;

    let now = Utc::now();
    let user = UserRecord {
        id: uuid::Uuid::new_v4().to_string(),
        username: request.username.clone(),
        email: request.email,
        password_hash,
        role: "user".into(),
        created_at: now,
        updated_at: now,
    };
    state.store.create_user(user).await?;
    info!(username = %request.username, "user registered");

    Ok(Json(json!({ "message": "registration successful" })))
}
