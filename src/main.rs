// src/main.rs
//! Sandbox Worker Pool
//!
//! Starts the worker processes, the health monitor and the HTTP front end,
//! then tears everything down on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use sandbox_pool::observability::{init_metrics, init_tracing};
use sandbox_pool::runtime::executor::Executor;
use sandbox_pool::runtime::health_monitor::HealthMonitor;
use sandbox_pool::runtime::process_manager::CommandLauncher;
use sandbox_pool::runtime::worker_pool::WorkerPool;
use sandbox_pool::server::{self, ApiServer};
use sandbox_pool::utils::config::EngineConfig;
use sandbox_pool::BuildInfo;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load().context("failed to load configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(config.observability.log_format)?;
    let metrics = init_metrics()?;

    let build = BuildInfo::current();
    info!(
        git_hash = build.git_hash,
        built_at = build.build_timestamp,
        rustc = build.rustc_version,
        "Starting sandbox pool v{}",
        build.version
    );
    info!("Configuration loaded: {:?}", config);

    // Start every worker up front; a launch failure is fatal
    info!(
        "Starting {} workers on ports {}..={}",
        config.pool.worker_num,
        config.pool.base_port,
        config.pool.port_for(config.pool.worker_num.saturating_sub(1))
    );
    let launcher = Arc::new(CommandLauncher::new(config.launcher.clone()));
    let pool = Arc::new(
        WorkerPool::start(config.pool.clone(), launcher)
            .await
            .context("failed to start worker pool")?,
    );

    let monitor = HealthMonitor::spawn(
        Arc::clone(&pool),
        config.pool.monitor_interval(),
        config.pool.monitor_join_timeout(),
    );

    let executor = Arc::new(Executor::new(Arc::clone(&pool), &config.pool));
    let api = Arc::new(ApiServer::new(executor, Some(metrics)));

    let listener = match server::bind(&config.server.bind_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            monitor.stop().await;
            pool.shutdown().await;
            return Err(e.into());
        }
    };

    // Graceful shutdown handler
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let served = api.serve(listener, shutdown).await;
    if let Err(e) = &served {
        error!("Server error: {}", e);
    }

    info!("Stopping health monitor and workers");
    monitor.stop().await;
    pool.shutdown().await;
    info!("Shutdown complete");

    served.map_err(Into::into)
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, cleaning up...");
    shutdown.cancel();
}
