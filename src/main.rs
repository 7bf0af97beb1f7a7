// Main entry point - Dependency injection and server setup
use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use metrics_sync::application::synchronizer::Synchronizer;
use metrics_sync::infrastructure::config::load_sync_config;
use metrics_sync::infrastructure::http_push_channel::HttpPushChannel;
use metrics_sync::infrastructure::http_repository::HttpMetricsRepository;
use metrics_sync::presentation::app_state::AppState;
use metrics_sync::presentation::router;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_sync_config()?;
    let options = config.sync.to_options()?;

    // Create collaborators (infrastructure layer)
    let repository = Arc::new(HttpMetricsRepository::new(
        config.backend.base_url.clone(),
        config.backend.token.clone(),
    ));
    let channel = Arc::new(HttpPushChannel::new(
        config.backend.base_url,
        config.backend.token,
        config.backend.compressed_frames,
    ));

    // Start the synchronizer (application layer)
    let (sync, sync_task) = Synchronizer::spawn(repository, channel, options)?;

    // Build router (presentation layer)
    let state = Arc::new(AppState { sync: sync.clone() });
    let app = router(state);

    // Start server
    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind_address))?;
    tracing::info!(%addr, "Starting metrics-sync service");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl-C, shutting down");
        })
        .await?;

    sync.shutdown().await;
    let _ = sync_task.await;

    Ok(())
}
