//! Server configuration from environment variables
//!
//! The server is configured the same way it is deployed: through its
//! environment. Every knob has a development-friendly default so
//! `rookery-server` starts with no setup (in-memory database, local bind).

use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration for the server process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// Path to the database file; None runs in-memory
    pub db_path: Option<String>,
    /// Optional SQL file executed after migrations. Users, contacts and
    /// groups live in external services, so standalone runs need seed data
    /// to be usable.
    pub seed_path: Option<String>,
    /// Shared HMAC key for capability token verification
    pub token_key: String,
    /// TTL for gateway sessions in the presence store
    pub session_ttl: Duration,
    /// Interval of the presence TTL sweeper
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Load configuration from `ROOKERY_*` environment variables
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("ROOKERY_BIND_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let db_path = std::env::var("ROOKERY_DB_PATH").ok();

        let seed_path = std::env::var("ROOKERY_SEED_PATH").ok();

        let token_key = std::env::var("ROOKERY_TOKEN_KEY")
            .unwrap_or_else(|_| "rookery-dev-key".to_string());

        let session_ttl = std::env::var("ROOKERY_SESSION_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(90));

        let sweep_interval = std::env::var("ROOKERY_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Self {
            bind_addr,
            db_path,
            seed_path,
            token_key,
            session_ttl,
            sweep_interval,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            db_path: None,
            seed_path: None,
            token_key: "rookery-dev-key".to_string(),
            session_ttl: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
        }
    }
}
