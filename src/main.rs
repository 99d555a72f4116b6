//! wsbroker server entry point.
//!
//! Starts the Axum HTTP server with the WebSocket chat endpoint and the
//! health check.

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use wsbroker::api;
use wsbroker::app_state::AppState;
use wsbroker::broker::Broker;
use wsbroker::config::GatewayConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing (LOG_FORMAT=json for structured output)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = GatewayConfig::from_env()?;
    tracing::info!(addr = %config.listen_addr, "starting wsbroker");

    // Build broker and application state
    let broker = Broker::new(config.broker.clone());
    let app = api::build_router(AppState::new(broker));

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
