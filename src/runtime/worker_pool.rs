// src/runtime/worker_pool.rs
//! Fixed-size pool of long-lived worker processes
//!
//! Slot `i` is bound to port `base_port + i` for the pool's lifetime; only the
//! process behind it changes across restarts.
//!
//! # Locking
//!
//! One `tokio::sync::Mutex` guards every [`WorkerRecord`]. It is held for
//! status flips, counter updates and restarts, never across socket I/O.
//! A restart waits for the old process at most for the grace period (twice
//! when SIGKILL is needed).
//!
//! # Allocation
//!
//! ```text
//! allocate(timeout)
//!   loop:
//!     lock → pick a random idle + live slot → busy → WorkerLease
//!     none: unlock, wait for a release or poll_interval, whichever first
//!   deadline → PoolError::PoolExhausted
//! ```
//!
//! There is no FIFO fairness between waiters.

use crate::observability::names;
use crate::runtime::process_manager::{stop_process, ProcessLauncher};
use crate::runtime::worker::{WorkerRecord, WorkerSnapshot, WorkerStatus};
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, Result};
use futures::future::join_all;
use metrics::{counter, gauge};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Exclusive claim on one busy worker
///
/// Obtained from [`WorkerPool::allocate`] and consumed by
/// [`WorkerPool::release`], so a lease can only be released once.
#[must_use = "a lease must be handed back through WorkerPool::release"]
#[derive(Debug)]
pub struct WorkerLease {
    slot: usize,
    port: u16,
    generation: u64,
}

impl WorkerLease {
    /// Port of the leased worker
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Why a worker is being restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Age reached the configured limit on release
    AgeLimit,
    /// Health monitor found the process dead
    Crash,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::AgeLimit => "age_limit",
            RestartReason::Crash => "crash",
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate pool state reported by `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealth {
    pub total: usize,
    /// Idle workers with a live process
    pub idle: usize,
    /// Busy workers with a live process
    pub busy: usize,
    /// Workers whose process has exited
    pub dead: usize,
    /// Sum of all restart counts
    pub restarts: u64,
    pub workers: Vec<WorkerSnapshot>,
}

/// The worker pool
pub struct WorkerPool {
    config: PoolConfig,
    launcher: Arc<dyn ProcessLauncher>,
    workers: Mutex<Vec<WorkerRecord>>,
    /// Signalled on every release so waiting allocators retry early
    released: Notify,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    /// Launch `worker_num` processes and build the pool
    ///
    /// Fails if any initial process cannot be launched; processes already
    /// started are stopped before returning the error.
    pub async fn start(config: PoolConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        config.validate()?;

        let mut workers = Vec::with_capacity(config.worker_num);
        for index in 0..config.worker_num {
            let port = config.port_for(index);
            match launcher.launch(port) {
                Ok(process) => workers.push(WorkerRecord::new(port, process)),
                Err(e) => {
                    error!(port, error = %e, "Failed to launch initial worker");
                    for record in workers.iter_mut() {
                        stop_process(record.process_mut(), config.grace_period()).await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            workers = config.worker_num,
            first_port = config.base_port,
            last_port = config.port_for(config.worker_num - 1),
            age_limit = config.age_limit,
            "Started worker pool"
        );

        let pool = Self {
            config,
            launcher,
            workers: Mutex::new(workers),
            released: Notify::new(),
            shutting_down: AtomicBool::new(false),
        };
        pool.publish_gauges(&mut *pool.workers.lock().await);
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.config.worker_num
    }

    /// Claim an idle, live worker, waiting up to `timeout`
    pub async fn allocate(&self, timeout: Duration) -> Result<WorkerLease> {
        let deadline = Instant::now() + timeout;

        loop {
            // Registered before scanning so a release racing the scan still wakes us
            let released = self.released.notified();

            {
                let mut workers = self.workers.lock().await;
                if let Some(lease) = Self::claim(&mut workers) {
                    self.publish_gauges(&mut workers);
                    return Ok(lease);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            debug!("All workers are busy, waiting for an available one");
            let wait = self.config.poll_interval().min(deadline - now);
            let _ = tokio::time::timeout(wait, released).await;
        }

        warn!(?timeout, "Timed out waiting for an available worker");
        counter!(names::EXHAUSTED_TOTAL).increment(1);
        Err(PoolError::PoolExhausted(timeout))
    }

    fn claim(workers: &mut [WorkerRecord]) -> Option<WorkerLease> {
        let candidates: Vec<usize> = workers
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, record)| record.is_available().then_some(slot))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let slot = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        let record = &mut workers[slot];
        record.mark_busy();
        counter!(names::ALLOCATIONS_TOTAL).increment(1);
        info!(port = record.port(), age = record.age(), "Assign worker");

        Some(WorkerLease {
            slot,
            port: record.port(),
            generation: record.generation(),
        })
    }

    /// Hand a leased worker back
    ///
    /// Counts one completed task and restarts the worker before returning if
    /// its age reached the limit. A lease whose worker was restarted by the
    /// health monitor while leased only wakes waiters: the slot was already
    /// reset and may belong to someone else by now.
    pub async fn release(&self, lease: WorkerLease) {
        {
            let mut workers = self.workers.lock().await;
            let Some(record) = workers.get_mut(lease.slot) else {
                error!(slot = lease.slot, "Release for unknown slot");
                return;
            };

            if record.generation() != lease.generation {
                warn!(
                    port = record.port(),
                    "Worker was restarted while leased, release ignored"
                );
            } else {
                let age = record.complete_task();
                info!(port = record.port(), age, "Release worker");

                if age >= self.config.age_limit {
                    if let Err(e) = self.restart(record, RestartReason::AgeLimit).await {
                        error!(port = record.port(), error = %e, "Failed to restart aged worker");
                    }
                }
            }
            self.publish_gauges(&mut workers);
        }
        self.released.notify_waiters();
    }

    /// Restart every worker whose process has exited
    ///
    /// Busy workers are included: their lease becomes stale and its release
    /// is ignored. Returns how many workers were restarted.
    pub async fn restart_dead_workers(&self) -> usize {
        if self.shutting_down.load(Ordering::SeqCst) {
            return 0;
        }

        let mut restarted = 0;
        {
            let mut workers = self.workers.lock().await;
            for record in workers.iter_mut() {
                if record.is_alive() {
                    continue;
                }
                warn!(
                    port = record.port(),
                    status = %record.status(),
                    "Worker crashed or exited unexpectedly, restarting"
                );
                match self.restart(record, RestartReason::Crash).await {
                    Ok(()) => restarted += 1,
                    Err(e) => error!(port = record.port(), error = %e, "Failed to restart dead worker"),
                }
            }
            self.publish_gauges(&mut workers);
        }
        if restarted > 0 {
            self.released.notify_waiters();
        }
        restarted
    }

    /// Replace the process behind `record` (pool lock held by the caller)
    async fn restart(&self, record: &mut WorkerRecord, reason: RestartReason) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(port = record.port(), "Pool shutting down, restart skipped");
            return Ok(());
        }

        info!(port = record.port(), age = record.age(), %reason, "Restarting worker");
        stop_process(record.process_mut(), self.config.grace_period()).await;

        match self.launcher.launch(record.port()) {
            Ok(process) => {
                record.replace_process(process);
                counter!(names::RESTARTS_TOTAL, "reason" => reason.as_str()).increment(1);
                info!(
                    port = record.port(),
                    restart_count = record.restart_count(),
                    "Worker restarted"
                );
                Ok(())
            }
            Err(e) => {
                // The dead process stays in place so the monitor retries
                record.mark_idle();
                Err(e)
            }
        }
    }

    /// Snapshot of every worker plus aggregates
    pub async fn health(&self) -> PoolHealth {
        let mut workers = self.workers.lock().await;
        let snapshots: Vec<WorkerSnapshot> = workers.iter_mut().map(WorkerRecord::snapshot).collect();

        PoolHealth {
            total: snapshots.len(),
            idle: snapshots
                .iter()
                .filter(|w| w.alive && w.status == WorkerStatus::Idle)
                .count(),
            busy: snapshots
                .iter()
                .filter(|w| w.alive && w.status == WorkerStatus::Busy)
                .count(),
            dead: snapshots.iter().filter(|w| !w.alive).count(),
            restarts: snapshots.iter().map(|w| w.restart_count).sum(),
            workers: snapshots,
        }
    }

    /// Terminate every live worker process
    ///
    /// Stop the health monitor first; restarts are refused from here on.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let grace = self.config.grace_period();

        let mut workers = self.workers.lock().await;
        join_all(
            workers
                .iter_mut()
                .map(|record| stop_process(record.process_mut(), grace)),
        )
        .await;
        self.publish_gauges(&mut workers);
        info!("All worker processes terminated");
    }

    fn publish_gauges(&self, workers: &mut [WorkerRecord]) {
        let (mut idle, mut busy, mut dead) = (0usize, 0usize, 0usize);
        for record in workers.iter_mut() {
            match (record.is_alive(), record.status()) {
                (false, _) => dead += 1,
                (true, WorkerStatus::Idle) => idle += 1,
                (true, WorkerStatus::Busy) => busy += 1,
            }
        }
        gauge!(names::IDLE_WORKERS).set(idle as f64);
        gauge!(names::BUSY_WORKERS).set(busy as f64);
        gauge!(names::DEAD_WORKERS).set(dead as f64);
    }
}
