// src/runtime/health_monitor.rs
//! Background loop restarting dead workers
//!
//! Every tick the monitor asks the pool to restart any worker whose process
//! has exited, busy or not. It is the only path by which a busy worker gets
//! recycled; the caller holding it finds out through its own dispatch error.

use crate::runtime::worker_pool::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to the running monitor task
pub struct HealthMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    join_timeout: Duration,
}

impl HealthMonitor {
    /// Start monitoring `pool` every `interval`
    pub fn spawn(pool: Arc<WorkerPool>, interval: Duration, join_timeout: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::run(pool, interval, cancel.clone()));

        info!(?interval, "Health monitor started");
        Self {
            cancel,
            handle,
            join_timeout,
        }
    }

    async fn run(pool: Arc<WorkerPool>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let restarted = pool.restart_dead_workers().await;
                    if restarted > 0 {
                        info!(restarted, "Health monitor restarted dead workers");
                    } else {
                        debug!("Health monitor tick: all workers alive");
                    }
                }
            }
        }
        debug!("Health monitor loop exited");
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop to exit and join it, aborting after the join timeout
    pub async fn stop(mut self) {
        self.cancel.cancel();
        match tokio::time::timeout(self.join_timeout, &mut self.handle).await {
            Ok(Ok(())) => info!("Health monitor stopped"),
            Ok(Err(e)) => warn!(error = %e, "Health monitor task failed"),
            Err(_) => {
                warn!(timeout = ?self.join_timeout, "Health monitor did not stop in time, aborting");
                self.handle.abort();
            }
        }
    }
}
