//! HTTP/WebSocket server for Rookery
//!
//! Wires the delivery core together: REST command surface, the websocket
//! session gateway, and the presence TTL sweeper. Business rules live in
//! the service modules; this layer is routing, state and middleware.

use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::conversations::ConversationAggregator;
use crate::db::{Database, MigrationRunner};
use crate::directory::Directory;
use crate::messages::{ChatService, MessageStore};
use crate::pipeline::{Pipeline, PipelineEvent};
use crate::presence::PresenceStore;

mod routes;

/// Server application state
pub struct AppState {
    pub chat: ChatService,
    pub conversations: ConversationAggregator,
    pub directory: Directory,
    pub presence: Arc<PresenceStore>,
    pub pipeline: Pipeline,
    pub verifier: TokenVerifier,
    pub db: Arc<Database>,
}

impl AppState {
    pub fn new(config: &ServerConfig, db: Arc<Database>) -> Self {
        let directory = Directory::new(Arc::clone(&db));
        let store = Arc::new(MessageStore::new(db));
        let pipeline = Pipeline::default();
        let presence = Arc::new(PresenceStore::new(config.session_ttl));

        Self {
            chat: ChatService::new(Arc::clone(&store), directory.clone(), pipeline.clone()),
            db: Arc::clone(store.db()),
            conversations: ConversationAggregator::new(store, directory.clone()),
            directory,
            presence,
            pipeline,
            verifier: TokenVerifier::new(config.token_key.as_bytes()),
        }
    }
}

/// Start the HTTP server
pub async fn start(config: ServerConfig) -> Result<()> {
    let db = match &config.db_path {
        Some(path) => Database::open_local("rookery", path).await?,
        None => Database::in_memory("rookery").await?,
    };
    let db = Arc::new(db);
    let runner = MigrationRunner::chat();
    runner.run(&db).await?;
    if let Some(version) = runner.current_version(&db).await? {
        info!(schema_version = version, "Database ready");
    }

    // Users, contacts and groups belong to external services; standalone
    // runs seed them from a SQL file
    if let Some(path) = &config.seed_path {
        let sql = std::fs::read_to_string(path)?;
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            db.execute(statement).await?;
        }
        info!(path = %path, "Applied seed data");
    }

    let state = Arc::new(AppState::new(&config, db));

    if let Ok(subject) = std::env::var("ROOKERY_DEV_TOKEN") {
        match subject
            .split_once(':')
            .and_then(|(id, name)| id.parse::<i64>().ok().map(|id| (id, name)))
        {
            Some((user_id, username)) => {
                let token = state.verifier.mint(user_id, username, 86_400);
                info!(%username, token, "Minted development token");
            }
            None => warn!("Ignoring malformed ROOKERY_DEV_TOKEN, expected 'id:username'"),
        }
    }
    spawn_presence_sweeper(&state, &config);

    let app = create_router(Arc::clone(&state));

    info!("Starting Axum HTTP server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Expire TTL-lapsed sessions on an interval, broadcasting the LEAVE deltas
fn spawn_presence_sweeper(state: &Arc<AppState>, config: &ServerConfig) {
    let presence = Arc::clone(&state.presence);
    let pipeline = state.pipeline.clone();
    let interval = config.sweep_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for event in presence.sweep() {
                pipeline.publish(PipelineEvent::Roster(event));
            }
        }
    });
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(routes::chat::router())
        .merge(routes::websocket::router())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let db_healthy = state.db.health_check().await.unwrap_or(false);
    Json(json!({
        "status": if db_healthy { "ok" } else { "degraded" },
        "service": "rookery-server",
        "version": env!("CARGO_PKG_VERSION"),
        "online_users": state.presence.online_users().len(),
        "gateway_sessions": state.pipeline.subscriber_count(),
    }))
}
