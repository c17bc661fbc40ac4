// src/lib.rs
//! Sandbox Worker Pool Library
//!
//! Runs a fixed set of long-lived sandbox worker processes, each listening on
//! its own loopback port, and executes tasks on them over a small TCP
//! protocol. Workers are recycled after a configurable number of tasks and
//! restarted when they crash.
//!
//! # Architecture
//!
//! - **runtime**: worker processes, the pool, dispatch and result classification
//! - **server**: HTTP front end (`/execute`, `/health`, `/metrics`)
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors

// Public module exports
pub mod observability;
pub mod runtime;
pub mod server;
pub mod utils;

// Re-export commonly used types
pub use runtime::executor::{ExecutionResult, Executor};
pub use runtime::worker_pool::{PoolHealth, WorkerPool};
pub use utils::config::EngineConfig;
pub use utils::errors::{PoolError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
