//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - public account + marketplace routes under `/api`
//! - JWT-guarded user routes under `/api/user`
//! - API-key-or-JWT-guarded OpenAI routes under `/v1`
//! - worker WebSocket endpoints (`/register/{id}`, `/response/{fingerprint}`)
//! - optional Swagger UI (disable with `ENABLE_SWAGGER=false`)

pub mod api;
pub mod doc;
pub mod health;
pub mod v1;
pub mod ws;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{auth_required, jwt_auth};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the broker.
pub fn build(state: AppState) -> Router {
    // ── CORS ─────────────────────────────────────────────────────────────────
    // Wildcard by default; restrict with CORS_ORIGINS in production.
    let cors = if let Some(origins_str) = &state.config.cors_allowed_origins {
        let origins: Vec<axum::http::HeaderValue> = origins_str
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if origins.is_empty() {
            CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
        } else {
            CorsLayer::new().allow_origin(origins).allow_headers(Any).allow_methods(Any)
        }
    } else {
        CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
    };

    let public_api = Router::new()
        .nest("/api", api::auth::router())
        .nest("/api/market", api::market::router());

    let user_api = Router::new()
        .merge(api::token::router())
        .merge(api::keys::router())
        .merge(api::usage::router())
        .layer(axum::middleware::from_fn_with_state(state.clone(), jwt_auth));

    let openai_api = v1::router()
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_required));

    let worker_ws = Router::new()
        .route("/register/{worker_id}", get(ws::register_worker))
        .route("/response/{fingerprint}", get(ws::response_channel));

    let mut app = Router::new()
        .merge(health::router())
        .merge(public_api)
        .nest("/api/user", user_api)
        .nest("/v1", openai_api)
        .merge(worker_ws);

    // ── Swagger UI ───────────────────────────────────────────────────────────
    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
