//! Headless engine binary: runs the schedulers and deadline job without the
//! HTTP status surface.

use std::io;

use handle_watch_domain::config::EngineConfig;
use handle_watch_domain::services::telemetry::{init_telemetry, TelemetryConfig};
use handle_watch_engine::{EngineError, EngineRuntime};
use handle_watch_storage::SeaOrmStorage;
use tracing::info;

#[tokio::main]
async fn main() -> io::Result<()> {
    if let Err(err) = bootstrap().await {
        eprintln!("[engine] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap() -> Result<(), EngineError> {
    let config = EngineConfig::load_from_env()?;
    let telemetry_config = TelemetryConfig::from_env("ENGINE");
    let _telemetry = init_telemetry(&telemetry_config)?;
    let storage = SeaOrmStorage::connect(config.database_url()).await?;
    let runtime = EngineRuntime::from_config(&config, storage)?;
    runtime.start().await?;

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    runtime.stop().await;
    Ok(())
}
