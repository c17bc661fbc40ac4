// src/runtime/worker.rs
//! Per-slot worker bookkeeping
//!
//! A [`WorkerRecord`] owns the process handle of one pool slot together with
//! its status and usage counters. Records are only ever mutated while the
//! pool lock is held.

use crate::runtime::process_manager::WorkerProcess;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Allocation status of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
        }
    }
}

/// State of one managed worker process
pub struct WorkerRecord {
    /// Port the process listens on; fixed for the slot's lifetime
    port: u16,

    /// Handle to the current process
    process: Box<dyn WorkerProcess>,

    status: WorkerStatus,

    /// Time of the last status transition
    last_used: DateTime<Utc>,

    /// Completed tasks since the last restart
    age: u64,

    /// Restarts since the pool started
    restart_count: u64,

    /// Bumped on every restart so stale leases can be recognised
    generation: u64,
}

impl WorkerRecord {
    pub fn new(port: u16, process: Box<dyn WorkerProcess>) -> Self {
        Self {
            port,
            process,
            status: WorkerStatus::Idle,
            last_used: Utc::now(),
            age: 0,
            restart_count: 0,
            generation: 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn restart_count(&self) -> u64 {
        self.restart_count
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    /// Whether the slot can be handed out right now
    pub fn is_available(&mut self) -> bool {
        self.status == WorkerStatus::Idle && self.process.is_alive()
    }

    pub fn process_mut(&mut self) -> &mut dyn WorkerProcess {
        self.process.as_mut()
    }

    /// Flip to busy for a new assignment
    pub(crate) fn mark_busy(&mut self) {
        self.status = WorkerStatus::Busy;
        self.last_used = Utc::now();
    }

    /// Return to idle after a completed assignment, returning the new age
    pub(crate) fn complete_task(&mut self) -> u64 {
        self.status = WorkerStatus::Idle;
        self.last_used = Utc::now();
        self.age += 1;
        self.age
    }

    /// Leave the slot idle without counting a task
    pub(crate) fn mark_idle(&mut self) {
        self.status = WorkerStatus::Idle;
        self.last_used = Utc::now();
    }

    /// Install a freshly launched process and reset usage
    pub(crate) fn replace_process(&mut self, process: Box<dyn WorkerProcess>) {
        self.process = process;
        self.status = WorkerStatus::Idle;
        self.last_used = Utc::now();
        self.age = 0;
        self.restart_count += 1;
        self.generation += 1;
    }

    pub fn snapshot(&mut self) -> WorkerSnapshot {
        WorkerSnapshot {
            port: self.port,
            status: self.status,
            age: self.age,
            restart_count: self.restart_count,
            alive: self.process.is_alive(),
            last_used: self.last_used,
        }
    }
}

impl fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("port", &self.port)
            .field("pid", &self.process.pid())
            .field("status", &self.status)
            .field("age", &self.age)
            .field("restart_count", &self.restart_count)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Point-in-time view of a worker, as reported by `/health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub port: u16,
    pub status: WorkerStatus,
    pub age: u64,
    pub restart_count: u64,
    pub alive: bool,
    pub last_used: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::process_manager::fake::FakeLauncher;
    use crate::runtime::process_manager::ProcessLauncher;

    #[test]
    fn test_new_record_is_idle() {
        let launcher = FakeLauncher::new();
        let mut record = WorkerRecord::new(5000, launcher.launch(5000).unwrap());

        assert_eq!(record.port(), 5000);
        assert_eq!(record.status(), WorkerStatus::Idle);
        assert_eq!(record.age(), 0);
        assert_eq!(record.restart_count(), 0);
        assert!(record.is_available());
    }

    #[test]
    fn test_task_cycle_counts_age() {
        let launcher = FakeLauncher::new();
        let mut record = WorkerRecord::new(5000, launcher.launch(5000).unwrap());

        record.mark_busy();
        assert_eq!(record.status(), WorkerStatus::Busy);
        assert!(!record.is_available());

        assert_eq!(record.complete_task(), 1);
        record.mark_busy();
        assert_eq!(record.complete_task(), 2);
        assert_eq!(record.status(), WorkerStatus::Idle);
    }

    #[test]
    fn test_replace_process_resets_usage() {
        let launcher = FakeLauncher::new();
        let mut record = WorkerRecord::new(5000, launcher.launch(5000).unwrap());
        record.mark_busy();
        record.complete_task();
        record.mark_busy();

        record.replace_process(launcher.launch(5000).unwrap());

        assert_eq!(record.port(), 5000);
        assert_eq!(record.status(), WorkerStatus::Idle);
        assert_eq!(record.age(), 0);
        assert_eq!(record.restart_count(), 1);
        assert_eq!(record.generation(), 1);
    }

    #[test]
    fn test_dead_process_is_unavailable() {
        let launcher = FakeLauncher::new();
        let mut record = WorkerRecord::new(5000, launcher.launch(5000).unwrap());
        launcher.current(5000).crash();

        assert!(!record.is_available());
        let snapshot = record.snapshot();
        assert!(!snapshot.alive);
        assert_eq!(snapshot.status, WorkerStatus::Idle);
    }

    #[test]
    fn test_snapshot_serialization() {
        let launcher = FakeLauncher::new();
        let mut record = WorkerRecord::new(5003, launcher.launch(5003).unwrap());
        record.mark_busy();

        let json = serde_json::to_value(record.snapshot()).unwrap();
        assert_eq!(json["port"], 5003);
        assert_eq!(json["status"], "busy");
        assert_eq!(json["age"], 0);
        assert_eq!(json["restart_count"], 0);
        assert_eq!(json["alive"], true);
    }
}
