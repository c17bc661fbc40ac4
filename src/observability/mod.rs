// src/observability/mod.rs
//! Logging and metrics
//!
//! - **Tracing**: `tracing-subscriber` with `RUST_LOG` filtering, pretty or JSON output
//! - **Metrics**: `metrics` facade backed by a Prometheus recorder, rendered at `/metrics`

use crate::utils::config::LogFormat;
use crate::utils::errors::{PoolError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, EnvFilter};

pub mod names {
    //! Metric names

    pub const ALLOCATIONS_TOTAL: &str = "pool_allocations_total";
    pub const EXHAUSTED_TOTAL: &str = "pool_exhausted_total";
    pub const RESTARTS_TOTAL: &str = "pool_restarts_total";
    pub const DISPATCH_OUTCOMES_TOTAL: &str = "dispatch_outcomes_total";
    pub const DISPATCH_DURATION_SECONDS: &str = "dispatch_duration_seconds";
    pub const IDLE_WORKERS: &str = "pool_idle_workers";
    pub const BUSY_WORKERS: &str = "pool_busy_workers";
    pub const DEAD_WORKERS: &str = "pool_dead_workers";
}

/// Install the global tracing subscriber
///
/// Defaults to `info` when `RUST_LOG` is unset.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
    };

    result.map_err(|e| PoolError::Config(format!("failed to install tracing subscriber: {}", e)))
}

/// Install the global Prometheus recorder
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PoolError::Config(format!("failed to install metrics recorder: {}", e)))
}
