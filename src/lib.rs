pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod intelligence;
pub mod models;
pub mod reminders;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use engine::{Collaborators, Engine, EngineError};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}

/// Run the engine against the on-disk database until Ctrl-C.
pub async fn run() -> Result<(), EngineError> {
    init_tracing();
    tracing::info!("Glycowatch starting v{}", config::APP_VERSION);

    let config = config::engine_config_from_env()?;
    let data_dir = config::app_data_dir();
    std::fs::create_dir_all(&data_dir).map_err(|source| config::ConfigError::Io {
        path: data_dir.display().to_string(),
        source,
    })?;

    let db_path = config::database_path();
    let period = std::time::Duration::from_secs(config.tick_seconds);
    let engine = Arc::new(Engine::open(&db_path, config, Collaborators::standalone())?);
    tracing::info!(path = %db_path.display(), "Database opened");

    let driver = engine::spawn_driver(engine, period);
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for shutdown signal: {e}");
    }
    tracing::info!("Shutdown requested");
    driver.stop().await;
    Ok(())
}
