// src/utils/mod.rs
//! Shared configuration and error types

pub mod config;
pub mod errors;

pub use config::{EngineConfig, LauncherConfig, LogFormat, PoolConfig, ServerConfig};
pub use errors::{PoolError, Result};
