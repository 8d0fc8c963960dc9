//! ember-server – entry point.
//!
//! Startup order:
//! 1. Parse and validate configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database and run pending migrations; seed the admin
//!    account when the users table is empty.
//! 4. Build the shared state (registries, caches, balancer).
//! 5. Start the background sweepers (join tokens, fingerprints).
//! 6. Build the Axum router and start the HTTP server with graceful shutdown.

mod auth;
mod config;
mod db;
mod dispatch;
mod error;
mod middleware;
mod registry;
mod routes;
mod schemas;
mod session;
mod state;

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::db::{UserRecord, UserStore};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env()?;

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: EMBER_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        policy = ?cfg.balance_policy,
        "ember-server starting"
    );
    if cfg.jwt_secret == "ember-dev-secret-change-me" {
        warn!("JWT_SECRET is the development default; set a real secret in production");
    }

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = SqliteStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "database ready");
    seed_admin(&store, &cfg).await?;

    // ── 4. Shared state ────────────────────────────────────────────────────────
    let state = AppState::new(cfg.clone(), store);

    // ── 5. Background sweepers ─────────────────────────────────────────────────
    {
        let tokens = std::sync::Arc::clone(&state.register_tokens);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                let swept = tokens.cleanup().await;
                if swept > 0 {
                    info!(swept, "expired join tokens removed");
                }
            }
        });
    }
    {
        let fingerprints = std::sync::Arc::clone(&state.fingerprints);
        let grace = chrono::Duration::seconds(cfg.fingerprint_grace_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                fingerprints.sweep(grace).await;
            }
        });
    }

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("ember-server stopped");
    Ok(())
}

/// Create the `admin` account on first run so the instance is usable before
/// any self-registration.
async fn seed_admin(store: &SqliteStore, cfg: &Config) -> anyhow::Result<()> {
    if store.count_users().await? > 0 {
        return Ok(());
    }
    let password_hash = auth::password::hash(&cfg.admin_password)
        .map_err(|e| anyhow::anyhow!("failed to hash admin password: {e}"))?;
    let now = Utc::now();
    store
        .create_user(UserRecord {
            id: "1".into(),
            username: "admin".into(),
            email: "admin@example.com".into(),
            password_hash,
            role: "admin".into(),
            created_at: now,
            updated_at: now,
        })
        .await?;
    warn!("seeded default admin account; change ADMIN_PASSWORD before exposing this instance");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
