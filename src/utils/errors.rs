// src/utils/errors.rs
//! Error types for the sandbox pool
//!
//! Task-level failures (compile errors, runtime errors) are not errors here:
//! they are returned as data by the executor. This enum covers the
//! infrastructure side only.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, PoolError>;

/// Infrastructure errors raised by the pool, launcher, protocol and server
#[derive(Debug, Error)]
pub enum PoolError {
    /// No idle, live worker became available before the allocation deadline
    #[error("no available worker process after {0:?}")]
    PoolExhausted(Duration),

    /// Worker process could not be launched
    #[error("failed to spawn worker process: {0}")]
    ProcessSpawnFailed(String),

    /// Worker process could not be stopped
    #[error("failed to terminate worker process: {0}")]
    ProcessTerminateFailed(String),

    /// No terminating response arrived before the dispatch deadline
    #[error("dispatch to port {port} timed out after {elapsed:?}")]
    DispatchTimeout { port: u16, elapsed: Duration },

    /// Socket-level failure while talking to a worker
    #[error("transport failure on port {port}: {source}")]
    Transport {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Invalid or unloadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP server failure
    #[error("server error: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        PoolError::Config(err.to_string())
    }
}

impl PoolError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted(_) | PoolError::Transport { .. } | PoolError::DispatchTimeout { .. }
        )
    }
}
