// src/runtime/mod.rs
//! Worker pool runtime
//!
//! - **Process Manager**: spawning, signalling and reaping worker processes
//! - **Worker**: per-worker bookkeeping (status, age, restarts)
//! - **Worker Pool**: allocation, release, age-based recycling, restarts
//! - **Health Monitor**: periodic restart of crashed workers
//! - **Dispatch**: the sentinel-terminated TCP exchange with a worker
//! - **Executor**: allocate → dispatch → classify → release
//!
//! # Architecture
//!
//! ```text
//!   POST /execute
//!        │
//!        ▼
//!   ┌──────────┐  allocate/release  ┌──────────────────────────────┐
//!   │ Executor │ ─────────────────▶ │ Worker Pool                  │
//!   └──────────┘                    │  :5000  :5001  ...  :5000+N-1│
//!        │ dispatch (TCP)           └──────────────────────────────┘
//!        ▼                                  ▲
//!   worker process on 127.0.0.1:port        │ restart dead workers
//!                                   ┌────────────────┐
//!                                   │ Health Monitor │
//!                                   └────────────────┘
//! ```

pub mod dispatch;
pub mod executor;
pub mod health_monitor;
pub mod process_manager;
pub mod worker;
pub mod worker_pool;

// Re-export commonly used types
pub use dispatch::Dispatcher;
pub use executor::{classify, ExecutionResult, Executor, Outcome};
pub use health_monitor::HealthMonitor;
pub use process_manager::{CommandLauncher, ProcessLauncher, WorkerProcess};
pub use worker::{WorkerRecord, WorkerSnapshot, WorkerStatus};
pub use worker_pool::{PoolHealth, WorkerLease, WorkerPool};
