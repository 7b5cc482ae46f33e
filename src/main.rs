//! streamcache server binary

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamcache::app;
use streamcache::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamcache=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting streamcache");
    let config = Config::from_env().context("Failed to load configuration")?;
    let config = Arc::new(config);
    tracing::info!(
        cache_path = %config.cache_path.display(),
        cache_size = config.cache_size,
        roots = config.library_roots.len(),
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.cache_path)
        .await
        .with_context(|| format!("Failed to create cache directory {}", config.cache_path.display()))?;

    let state = app::build_services(config.clone()).await;
    state.services.start_all().await?;
    tracing::info!("Listening on {}:{}", config.host, config.port);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    state.services.stop_all().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
