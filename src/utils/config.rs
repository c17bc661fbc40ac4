// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate:
//!
//! 1. Compiled defaults (see the `Default` impls below)
//! 2. Optional TOML/YAML/JSON file (`SANDBOX_POOL_CONFIG`, else `sandbox-pool.toml`)
//! 3. Environment variables, e.g. `SANDBOX_POOL__POOL__WORKER_NUM=4`
//!
//! Configuration is read once at start-up and never mutated afterwards.

use crate::utils::errors::{PoolError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SANDBOX_POOL_CONFIG";

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "sandbox-pool";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub launcher: LauncherConfig,
    pub server: ServerConfig,
    pub observability: ObservabilityConfig,
}

/// Worker pool sizing and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes (fixed for the pool's lifetime)
    pub worker_num: usize,

    /// First worker port; slot `i` listens on `base_port + i`
    pub base_port: u16,

    /// Completed tasks after which a worker is recycled
    pub age_limit: u64,

    /// Dispatch deadline when a request does not carry one
    pub default_timeout_secs: u64,

    /// How long `allocate` waits for an idle worker
    pub allocate_timeout_ms: u64,

    /// Sleep between allocation attempts
    pub poll_interval_ms: u64,

    /// Wait after SIGTERM before SIGKILL
    pub grace_period_ms: u64,

    /// TCP connect timeout towards a worker
    pub connect_timeout_ms: u64,

    /// Health monitor tick
    pub monitor_interval_ms: u64,

    /// Bounded wait when joining the health monitor on shutdown
    pub monitor_join_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_num: 8,
            base_port: 5000,
            age_limit: 200,
            default_timeout_secs: 10,
            allocate_timeout_ms: 3_000,
            poll_interval_ms: 50,
            grace_period_ms: 2_000,
            connect_timeout_ms: 5_000,
            monitor_interval_ms: 2_000,
            monitor_join_timeout_ms: 3_000,
        }
    }
}

impl PoolConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_millis(self.allocate_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn monitor_join_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_join_timeout_ms)
    }

    /// Port bound to slot `index`
    pub fn port_for(&self, index: usize) -> u16 {
        self.base_port + index as u16
    }

    /// Validate sizing and timing
    pub fn validate(&self) -> Result<()> {
        if self.worker_num == 0 {
            return Err(PoolError::Config("pool.worker_num must be at least 1".into()));
        }
        if self.age_limit == 0 {
            return Err(PoolError::Config("pool.age_limit must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(PoolError::Config("pool.poll_interval_ms must be at least 1".into()));
        }
        if self.monitor_interval_ms == 0 {
            return Err(PoolError::Config("pool.monitor_interval_ms must be at least 1".into()));
        }
        let last_port = self.base_port as usize + self.worker_num - 1;
        if self.base_port == 0 || last_port > u16::MAX as usize {
            return Err(PoolError::Config(format!(
                "port range {}..={} is not valid",
                self.base_port, last_port
            )));
        }
        Ok(())
    }
}

/// How worker processes are started
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Executable to run
    pub program: String,

    /// Arguments placed before the port argument
    pub args: Vec<String>,

    /// User id the worker runs as
    pub uid: Option<u32>,

    /// Group id the worker runs as
    pub gid: Option<u32>,

    /// Working directory for the worker
    pub work_dir: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: "java".to_string(),
            args: vec![
                "-cp".to_string(),
                ".:/opt/java_libs/junit-platform-console-standalone.jar:/opt/java_libs/json.jar"
                    .to_string(),
                "WorkerMain".to_string(),
            ],
            uid: None,
            gid: None,
            work_dir: None,
        }
    }
}

/// HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6000,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
}

impl EngineConfig {
    /// Load configuration from defaults, optional file and environment
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load_from(Some(Path::new(&path))),
            None => Self::load_from(None),
        }
    }

    /// Load configuration, reading `path` if given (it must then exist)
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&EngineConfig::default())?;

        let mut builder = Config::builder().add_source(defaults);
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix("SANDBOX_POOL")
                .prefix_separator("__")
                .separator("__")
                .list_separator(" ")
                .with_list_parse_key("launcher.args")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.launcher.program.trim().is_empty() {
            return Err(PoolError::Config("launcher.program must not be empty".into()));
        }
        Ok(())
    }
}
