//! Rookery Server
//!
//! Realtime chat delivery backend: durable message store, per-recipient
//! delivery state, presence, and websocket fan-out.

mod auth;
mod config;
mod conversations;
mod db;
mod directory;
mod messages;
mod pipeline;
mod presence;
mod server;
mod telemetry;

use anyhow::Result;
use tracing::info;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = if std::env::var("ROOKERY_PRETTY_LOGS").is_ok() {
        telemetry::init_local()
    } else {
        telemetry::init()
    };
    telemetry.map_err(|e| anyhow::anyhow!("telemetry init failed: {}", e))?;

    let config = ServerConfig::from_env();
    info!(
        bind = %config.bind_addr,
        db = config.db_path.as_deref().unwrap_or("in-memory"),
        "Starting Rookery Server"
    );

    server::start(config).await
}
