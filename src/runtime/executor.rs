// src/runtime/executor.rs
//! Execution façade
//!
//! The single entry point for running a task: allocate a worker, dispatch,
//! release, classify. Task failures (compile/runtime errors) and
//! infrastructure failures (exhausted pool, timeout, transport) all come back
//! as an [`ExecutionResult`]; nothing here returns an error to the transport.

use crate::observability::names;
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::worker_pool::{WorkerLease, WorkerPool};
use crate::utils::config::PoolConfig;
use crate::utils::errors::PoolError;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};
use ulid::Ulid;

/// Worker reports that the task failed to build
pub const COMPILE_ERROR_MARKER: &str = "COMPILE_ERROR";
/// Worker reports that the task raised or crashed while running
pub const RUNTIME_ERROR_MARKER: &str = "RUNTIME_ERROR";
/// Worker reports a completed run; output follows the header line
pub const RUN_RESULT_MARKER: &str = "RUN_RESULT";
/// Whole-payload sentinel meaning nobody answered in time
pub const TIMEOUT_SENTINEL: &str = "TIMEOUT";

/// Error string returned when no worker could be allocated
pub const POOL_EXHAUSTED_MESSAGE: &str = "No available worker process";

/// Typed result of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Output after the run-result header line
    Success(String),
    /// Full worker payload starting with the compile-error marker
    CompileError(String),
    /// Full worker payload starting with the runtime-error marker
    RuntimeError(String),
    Timeout,
    /// Anything else, including transport failures
    Failure(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::CompileError(_) => "compile_error",
            Outcome::RuntimeError(_) => "runtime_error",
            Outcome::Timeout => "timeout",
            Outcome::Failure(_) => "failure",
        }
    }
}

/// Classify a raw worker payload
pub fn classify(raw: &str) -> Outcome {
    if raw.starts_with(COMPILE_ERROR_MARKER) {
        Outcome::CompileError(raw.to_string())
    } else if raw == TIMEOUT_SENTINEL {
        Outcome::Timeout
    } else if raw.starts_with(RUNTIME_ERROR_MARKER) {
        Outcome::RuntimeError(raw.to_string())
    } else if raw.starts_with(RUN_RESULT_MARKER) {
        let output = raw.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        Outcome::Success(output.to_string())
    } else {
        Outcome::Failure(raw.to_string())
    }
}

/// `(success, output, error)` as returned to HTTP callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }
}

impl From<Outcome> for ExecutionResult {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(output) => Self {
                success: true,
                output,
                error: String::new(),
            },
            Outcome::CompileError(error) | Outcome::RuntimeError(error) | Outcome::Failure(error) => {
                Self::failure(error)
            }
            Outcome::Timeout => Self::failure(TIMEOUT_SENTINEL),
        }
    }
}

/// Runs tasks on the pool
pub struct Executor {
    pool: Arc<WorkerPool>,
    dispatcher: Dispatcher,
    allocate_timeout: Duration,
    default_timeout: Duration,
}

impl Executor {
    pub fn new(pool: Arc<WorkerPool>, config: &PoolConfig) -> Self {
        Self {
            pool,
            dispatcher: Dispatcher::new(config.connect_timeout()),
            allocate_timeout: config.allocate_timeout(),
            default_timeout: config.default_timeout(),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `task_path` on some worker with the given dispatch deadline
    ///
    /// The leased worker is released on every path once dispatch returns. If
    /// this future is dropped or unwinds mid-dispatch, the release happens on
    /// a background task instead.
    pub async fn execute(&self, task_path: &str, timeout: Option<Duration>) -> ExecutionResult {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let span = info_span!("execute", request_id = %Ulid::new(), task_path);

        async move {
            info!(?timeout, "Received execution request");

            let lease = match self.pool.allocate(self.allocate_timeout).await {
                Ok(lease) => lease,
                Err(e) => {
                    error!(error = %e, retryable = e.is_retryable(), "No available worker process, request denied");
                    counter!(names::DISPATCH_OUTCOMES_TOTAL, "outcome" => "pool_exhausted").increment(1);
                    return ExecutionResult::failure(POOL_EXHAUSTED_MESSAGE);
                }
            };

            let lease = LeaseGuard::new(Arc::clone(&self.pool), lease);
            let port = lease.port();
            let started = Instant::now();
            let dispatched = self.dispatcher.dispatch(port, task_path, timeout).await;
            lease.release().await;
            histogram!(names::DISPATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

            let outcome = match dispatched {
                Ok(raw) => classify(&raw),
                Err(PoolError::DispatchTimeout { .. }) => Outcome::Timeout,
                Err(e) => {
                    error!(port, error = %e, retryable = e.is_retryable(), "Worker task error");
                    Outcome::Failure(format!("ERROR: {}", e))
                }
            };
            counter!(names::DISPATCH_OUTCOMES_TOTAL, "outcome" => outcome.label()).increment(1);

            match &outcome {
                Outcome::Success(_) => info!(port, "Execution succeeded"),
                Outcome::CompileError(_) => info!(port, "Compilation error"),
                Outcome::Timeout => warn!(port, "Execution timed out"),
                Outcome::RuntimeError(raw) | Outcome::Failure(raw) => {
                    warn!(port, outcome = outcome.label(), result = %preview(raw), "Execution failed")
                }
            }

            ExecutionResult::from(outcome)
        }
        .instrument(span)
        .await
    }
}

/// Releases its lease on drop if `release` was never reached
///
/// Covers unwinding and a dropped `execute` future. The drop path cannot
/// await, so it hands the release to a spawned task.
struct LeaseGuard {
    pool: Arc<WorkerPool>,
    lease: Option<WorkerLease>,
}

impl LeaseGuard {
    fn new(pool: Arc<WorkerPool>, lease: WorkerLease) -> Self {
        Self {
            pool,
            lease: Some(lease),
        }
    }

    fn port(&self) -> u16 {
        self.lease.as_ref().map_or(0, WorkerLease::port)
    }

    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.release(lease).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        warn!(port = lease.port(), "Execution abandoned, releasing worker in the background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move { pool.release(lease).await });
            }
            Err(e) => error!(port = lease.port(), error = %e, "No runtime to release worker on"),
        }
    }
}

/// First 100 characters, for logs
fn preview(raw: &str) -> &str {
    match raw.char_indices().nth(100) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
