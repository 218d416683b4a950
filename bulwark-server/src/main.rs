use std::sync::Arc;

use anyhow::Result;
use bulwark_client::{MemoryStore, RedisStore, SharedStore};
use bulwark_server::config::{Config, StoreKind};
use bulwark_server::transport::{AppState, HttpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("bulwark={}", config.log_level).parse()?),
        )
        .init();

    let store: SharedStore = match config.store.kind {
        StoreKind::Redis => Arc::new(RedisStore::connect(config.store.client.clone())?),
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store; limits are not shared between instances");
            Arc::new(MemoryStore::new())
        }
    };

    let state = Arc::new(AppState::from_config(&config, store.clone()));

    tracing::info!(
        "Bulwark started with store: {:?}, default limit: {}/{}s, {} route overrides",
        config.store.kind,
        config.rate.default.limit,
        config.rate.default.window.as_secs(),
        config.rate.routes.len()
    );
    tracing::info!(
        "Max concurrent requests: {}, cache enabled: {}",
        state.backpressure.max(),
        config.cache.enabled
    );

    let transport = HttpTransport::new(&config.http.host, config.http.port)?;
    let result = transport.serve(state, shutdown_signal()).await;

    store.close().await;
    tracing::info!("Bulwark stopped");

    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
