//! Tracing initialization for Rookery Server
//!
//! Structured logging via tracing-subscriber with an environment-driven
//! filter. Console output only; an OTLP exporter can be layered in here
//! when a collector is part of the deployment.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for server runs.
///
/// # Configuration
///
/// - `RUST_LOG`: log filter (default: `info,rookery_server=debug`)
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rookery_server=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Telemetry initialized");
    Ok(())
}

/// Initialize tracing for local development with pretty console output
pub fn init_local() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rookery_server=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Local telemetry initialized");
    Ok(())
}
