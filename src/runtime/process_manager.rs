// src/runtime/process_manager.rs
//! Worker process launching and termination
//!
//! The pool never touches `tokio::process` directly. It sees two seams:
//!
//! - [`ProcessLauncher`]: starts a worker bound to a port
//! - [`WorkerProcess`]: the handle the pool keeps per slot (liveness, terminate, kill, reap)
//!
//! [`CommandLauncher`] and [`ChildProcess`] are the real implementations.

use crate::utils::config::LauncherConfig;
use crate::utils::errors::{PoolError, Result};
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long an already-exited process is waited on when reaping it
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to one running worker process
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if still known
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness probe
    fn is_alive(&mut self) -> bool;

    /// Request graceful termination (SIGTERM)
    fn terminate(&mut self) -> Result<()>;

    /// Force termination (SIGKILL)
    fn kill(&mut self) -> Result<()>;

    /// Wait for the process to exit, returning whether it did within `timeout`
    async fn wait_for_exit(&mut self, timeout: Duration) -> bool;
}

/// Starts worker processes bound to a local port
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, port: u16) -> Result<Box<dyn WorkerProcess>>;
}

/// Stop a worker process and reap it
///
/// Live processes get SIGTERM, then SIGKILL once `grace` has elapsed.
/// Already-exited processes are only reaped.
pub async fn stop_process(process: &mut dyn WorkerProcess, grace: Duration) {
    if !process.is_alive() {
        if !process.wait_for_exit(REAP_TIMEOUT).await {
            warn!(pid = ?process.pid(), "Failed to reap exited worker process");
        }
        return;
    }

    if let Err(e) = process.terminate() {
        warn!(pid = ?process.pid(), error = %e, "SIGTERM failed, killing worker process");
    } else if process.wait_for_exit(grace).await {
        debug!(pid = ?process.pid(), "Worker process exited after SIGTERM");
        return;
    }

    debug!(pid = ?process.pid(), "Worker process still alive, sending SIGKILL");
    if let Err(e) = process.kill() {
        warn!(pid = ?process.pid(), error = %e, "Failed to kill worker process");
    }
    if !process.wait_for_exit(grace).await {
        warn!(pid = ?process.pid(), "Worker process did not exit after SIGKILL");
    }
}

/// A worker spawned through `tokio::process`
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!(error = %e, "Failed to poll worker process status");
                false
            }
        }
    }

    fn terminate(&mut self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // No pid means the exit status has already been collected
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PoolError::ProcessTerminateFailed(format!(
                "failed to send SIGTERM to {}: {}",
                pid, e
            ))),
        }
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // already reaped
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(PoolError::ProcessTerminateFailed(format!(
                "failed to send SIGKILL: {}",
                e
            ))),
        }
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "Worker process exited");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for worker process");
                false
            }
            Err(_) => false,
        }
    }
}

/// Launches `program args... <port>` with output discarded
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    config: LauncherConfig,
}

impl CommandLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    fn command(&self, port: u16) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(work_dir) = &self.config.work_dir {
            command.current_dir(work_dir);
        }

        #[cfg(unix)]
        {
            if let Some(gid) = self.config.gid {
                command.gid(gid);
            }
            if let Some(uid) = self.config.uid {
                command.uid(uid);
            }
        }

        command
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, port: u16) -> Result<Box<dyn WorkerProcess>> {
        let child = self.command(port).spawn().map_err(|e| {
            PoolError::ProcessSpawnFailed(format!(
                "failed to spawn '{}' for port {}: {}",
                self.config.program, port, e
            ))
        })?;

        debug!(port, pid = ?child.id(), program = %self.config.program, "Worker process spawned");
        Ok(Box::new(ChildProcess::new(child)))
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory process handles for pool tests

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Shared state behind a [`FakeProcess`], inspectable from tests
    #[derive(Debug, Default)]
    pub struct FakeState {
        pub alive: AtomicBool,
        pub ignore_sigterm: AtomicBool,
        pub terminate_calls: AtomicU32,
        pub kill_calls: AtomicU32,
        pub reaped: AtomicBool,
    }

    impl FakeState {
        /// Simulate the process dying out-of-band
        pub fn crash(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        pub fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    pub struct FakeProcess {
        pid: u32,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_alive(&mut self) -> bool {
            self.state.is_alive()
        }

        fn terminate(&mut self) -> Result<()> {
            self.state.terminate_calls.fetch_add(1, Ordering::SeqCst);
            if !self.state.ignore_sigterm.load(Ordering::SeqCst) {
                self.state.alive.store(false, Ordering::SeqCst);
            }
            Ok(())
        }

        fn kill(&mut self) -> Result<()> {
            self.state.kill_calls.fetch_add(1, Ordering::SeqCst);
            self.state.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
            if self.state.is_alive() {
                tokio::time::sleep(timeout).await;
            }
            let exited = !self.state.is_alive();
            if exited {
                self.state.reaped.store(true, Ordering::SeqCst);
            }
            exited
        }
    }

    /// Launcher recording every process it starts
    #[derive(Default)]
    pub struct FakeLauncher {
        launched: Mutex<Vec<(u16, Arc<FakeState>)>>,
        fail: AtomicBool,
        ignore_sigterm: AtomicBool,
    }

    impl FakeLauncher {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make subsequent launches fail
        pub fn fail_launches(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// Make subsequently launched processes ignore SIGTERM
        pub fn ignore_sigterm(&self, ignore: bool) {
            self.ignore_sigterm.store(ignore, Ordering::SeqCst);
        }

        /// Total launches so far
        pub fn launch_count(&self) -> usize {
            self.launched.lock().unwrap().len()
        }

        /// Launches for one port
        pub fn launches_for(&self, port: u16) -> usize {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| *p == port)
                .count()
        }

        /// State of the most recent process launched on `port`
        pub fn current(&self, port: u16) -> Arc<FakeState> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(p, _)| *p == port)
                .map(|(_, state)| Arc::clone(state))
                .expect("no process launched on port")
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, port: u16) -> Result<Box<dyn WorkerProcess>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PoolError::ProcessSpawnFailed(format!(
                    "launch disabled for port {}",
                    port
                )));
            }
            let state = Arc::new(FakeState::default());
            state.alive.store(true, Ordering::SeqCst);
            state
                .ignore_sigterm
                .store(self.ignore_sigterm.load(Ordering::SeqCst), Ordering::SeqCst);

            let mut launched = self.launched.lock().unwrap();
            let pid = 10_000 + launched.len() as u32;
            launched.push((port, Arc::clone(&state)));
            Ok(Box::new(FakeProcess { pid, state }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper() -> LauncherConfig {
        // `sh -c 'sleep 30' sh <port>`: the port lands in $1 and is ignored
        LauncherConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string(), "sh".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_launch_and_stop_real_process() {
        let launcher = CommandLauncher::new(sleeper());
        let mut process = launcher.launch(5999).unwrap();

        assert!(process.pid().is_some());
        assert!(process.is_alive());

        stop_process(process.as_mut(), Duration::from_secs(2)).await;
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_reap_exited_process() {
        let launcher = CommandLauncher::new(LauncherConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string(), "sh".to_string()],
            ..Default::default()
        });
        let mut process = launcher.launch(5998).unwrap();

        assert!(process.wait_for_exit(Duration::from_secs(5)).await);
        assert!(!process.is_alive());

        // terminate and kill on a reaped process are no-ops
        assert!(process.terminate().is_ok());
        assert!(process.kill().is_ok());
        stop_process(process.as_mut(), Duration::from_millis(100)).await;
    }

    #[test]
    fn test_launch_missing_executable() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let launcher = CommandLauncher::new(LauncherConfig {
            program: "/nonexistent/worker-binary".to_string(),
            args: vec![],
            ..Default::default()
        });
        let result = launcher.launch(5997);
        assert!(matches!(result, Err(PoolError::ProcessSpawnFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_to_kill() {
        let launcher = fake::FakeLauncher::new();
        launcher.ignore_sigterm(true);
        let mut process = launcher.launch(5000).unwrap();
        let state = launcher.current(5000);

        stop_process(process.as_mut(), Duration::from_secs(2)).await;

        assert_eq!(state.terminate_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(state.kill_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!state.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_graceful_skips_kill() {
        let launcher = fake::FakeLauncher::new();
        let mut process = launcher.launch(5000).unwrap();
        let state = launcher.current(5000);

        stop_process(process.as_mut(), Duration::from_secs(2)).await;

        assert_eq!(state.terminate_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(state.kill_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(state.reaped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
