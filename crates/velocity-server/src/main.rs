//! # Velocity Worker Daemon
//!
//! Main entry point for `velocity-workerd`.
//!
//! Loads configuration, connects a job manager to the Redis store, runs the
//! worker pool until Ctrl+C or SIGTERM, then drains it.

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use velocity_config::{AppConfig, ConfigLoader};
use velocity_core::{init_telemetry, VelocityResult};
use velocity_jobs::{register_metrics, JobManager, RedisConnector};
use velocity_server::runners::builtin_runners;
use velocity_server::startup;

#[tokio::main]
async fn main() {
    let config = match load_config().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&config.telemetry) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    startup::print_banner();
    info!("Starting Velocity worker daemon...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    if let Err(e) = run(config).await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn load_config() -> VelocityResult<AppConfig> {
    let loader = ConfigLoader::from_default_location()?;
    Ok(loader.get().await)
}

async fn run(config: AppConfig) -> VelocityResult<()> {
    if config.metrics.enabled {
        startup::install_metrics_exporter(&config.metrics)?;
    }
    register_metrics();

    let jobs = config.jobs.clone();
    let connector = Arc::new(RedisConnector::new(
        jobs.redis.clone(),
        jobs.manager.priority_levels(),
        jobs.manager.pop_timeout(),
    ));

    let runners = builtin_runners();
    info!(job_types = ?runners.job_types(), "Run functions loaded");

    let manager = JobManager::new(jobs, connector, runners);
    manager.start().await?;
    startup::print_startup_info(&config);

    shutdown_signal().await;

    manager.stop();
    manager.wait_stopped().await?;

    let snapshot = manager.snapshot();
    info!(
        completed = snapshot.completed_total,
        failed = snapshot.failed_total,
        restarts = snapshot.restarts,
        "Worker daemon shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
