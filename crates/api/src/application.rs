use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use handle_watch_domain::config::{ApiConfig, ConfigError, EngineConfig};
use handle_watch_domain::services::telemetry::{init_telemetry, TelemetryConfig, TelemetryError};
use handle_watch_domain::storage::StorageError;
use handle_watch_engine::{EngineError, EngineRuntime};
use handle_watch_storage::SeaOrmStorage;
use thiserror::Error;
use tracing::info;

use crate::{handlers, state::AppState};

pub async fn run() -> Result<(), BootstrapError> {
    let api_config = ApiConfig::load_from_env()?;
    let engine_config = EngineConfig::load_from_env()?;

    let telemetry_config = TelemetryConfig::from_env("API");
    let telemetry = init_telemetry(&telemetry_config)?;

    let storage = SeaOrmStorage::connect(engine_config.database_url()).await?;
    let runtime = Arc::new(EngineRuntime::from_config(&engine_config, storage)?);
    runtime.start().await?;

    let state = AppState::new(runtime.clone(), telemetry);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Logger::default())
            .configure(routes)
    })
    .bind(api_config.status_bind_address())?
    .run();

    info!(address = api_config.status_bind_address(), "status listener started");
    let served = server.await;

    // The server future resolves once actix has handled SIGINT/SIGTERM.
    runtime.stop().await;
    served?;
    Ok(())
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(handlers::metrics_handler))
        .route(
            "/api/v1/scheduler/status",
            web::get().to(handlers::scheduler_status_handler),
        )
        .route(
            "/api/v1/scheduler/users/{id}",
            web::get().to(handlers::user_status_handler),
        )
        .route(
            "/api/v1/scheduler/users/{id}",
            web::put().to(handlers::update_schedule_handler),
        )
        .route(
            "/api/v1/scheduler/users/{id}/trigger",
            web::post().to(handlers::trigger_handler),
        )
        .route(
            "/api/v1/deadlines/run",
            web::post().to(handlers::run_deadlines_handler),
        )
        .route(
            "/api/v1/users/{id}/api-keys",
            web::get().to(handlers::api_key_status_handler),
        )
        .route(
            "/api/v1/users/{id}/proxies/stats",
            web::get().to(handlers::proxy_stats_handler),
        )
        .route(
            "/api/v1/users/{id}/proxies/import",
            web::post().to(handlers::import_proxies_handler),
        );
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
