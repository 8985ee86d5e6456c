//! Crop tile server.
//!
//! Serves the vector tile layers described in `layers.yml` from PostGIS over HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crop_tiles::config::Config;
use crop_tiles::server::{self, AppState};
use crop_tiles::TileExecutor;

fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .json()
        .init();

    let layers = config.load_layers()?;
    for layer in layers.iter() {
        info!(layer = %layer.id, route = %layer.route, "registered layer");
    }
    if config.api_key.is_none() {
        info!("no API key configured; tile path tokens are accepted as-is");
    }

    let pool = config
        .connect()
        .await
        .with_context(|| format!("connecting to {}:{}", config.db_host, config.db_port))?;
    info!(host = %config.db_host, database = %config.db_name, "connected to PostGIS");

    let executor = TileExecutor::new(pool, config.query_timeout());
    let app = server::router(Arc::new(AppState::new(layers, executor)));

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("unable to listen for shutdown signal: {}", e);
    }
}
