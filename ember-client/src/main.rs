//! ember-client – entry point.
//!
//! Bring-up order: configuration, tracing, engine adapters, the local UI
//! socket, then the control-channel loop (which reconnects forever).

mod channel;
mod config;
mod control;
mod engines;
mod error;
mod ui_link;

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::control::Controller;
use crate::engines::{EngineSet, PriceTable};
use crate::ui_link::UiLink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if cfg.token.is_empty() {
        anyhow::bail!(
            "a join token is required: pass --token or set EMBER_TOKEN \
             (mint one with POST /api/user/register-token)"
        );
    }

    let worker_id = config::worker_id();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_id = %worker_id,
        broker = %cfg.host,
        engines = %cfg.engine,
        "ember-client starting"
    );

    let prices = Arc::new(PriceTable::new(cfg.default_ippm, cfg.default_oppm));
    let engines = Arc::new(EngineSet::from_config(&cfg, Arc::clone(&prices)).await?);

    let ui = if cfg.no_ui {
        UiLink::disabled()
    } else {
        UiLink::spawn(&cfg.ui_addr, Arc::clone(&prices)).await?
    };

    let controller = Arc::new(Controller::new(cfg, worker_id, engines, ui));
    controller.run().await;
    Ok(())
}
