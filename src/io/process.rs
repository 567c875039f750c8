//! Process management layer
//!
//! Spawns the language server, watches its stderr sideband and reports its
//! exit. Knows nothing about the protocol spoken over stdin/stdout.

use crate::io::transport::StdioTransport;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

// ============================================================================
// Process State
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, letting the server clean up
    Graceful,
    /// SIGKILL
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    Stopped,
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Exit Notification
// ============================================================================

/// Fired once when the server process exits, for whatever reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    pub pid: Option<u32>,
    /// Exit code, `None` when the process was killed by a signal or the
    /// wait itself failed
    pub code: Option<i32>,
}

impl ProcessExitEvent {
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Receives process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

/// Receives the server's stderr, one line at a time
pub trait StderrMonitor: Send + Sync {
    /// Install the stderr line handler. Must be called before `start()`;
    /// stderr is drained regardless so the server never blocks on it.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Lifecycle of the external server process
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn start(&mut self) -> Result<(), ProcessError>;

    /// Signal the process. `Force` reports it stopped at once; after
    /// `Graceful` it stays running until it actually exits.
    async fn stop(&mut self, mode: StopMode) -> Result<(), ProcessError>;

    fn is_running(&self) -> bool;

    /// Hand out the stdio transport. Succeeds once per start.
    fn create_stdio_transport(&mut self) -> Result<StdioTransport, ProcessError>;

    /// Install the exit handler. Must be called before `start()`.
    fn on_process_exit(&mut self, handler: Arc<dyn ProcessExitHandler>);

    /// Force kill without awaiting anything, for use in `Drop`
    fn kill_sync(&mut self);
}

/// Process manager backed by `tokio::process`
pub struct ChildProcessManager {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,

    state: Arc<Mutex<ProcessState>>,

    /// Taken by the first `create_stdio_transport()` call
    stdio_transport: Option<StdioTransport>,

    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,
    stderr_task: Option<JoinHandle<()>>,

    wait_task: Option<JoinHandle<()>>,
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            args,
            working_directory: working_dir,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            wait_task: None,
            exit_handler: None,
        }
    }

    pub fn get_state(&self) -> ProcessState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or(ProcessState::Stopped)
    }

    fn set_state(&self, new_state: ProcessState) {
        if let Ok(mut state) = self.state.lock() {
            *state = new_state;
        }
    }

    fn spawn_stderr_monitor(&mut self, stderr: ChildStderr) {
        let handler = self.stderr_handler.take();

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim_end();
                        if line.is_empty() {
                            continue;
                        }
                        match &handler {
                            Some(handler) => handler(line.to_string()),
                            None => trace!("ChildProcessManager: stderr drained: {}", line),
                        }
                    }
                    Ok(None) => {
                        trace!("ChildProcessManager: stderr EOF reached");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read from server stderr: {}", e);
                        break;
                    }
                }
            }
        });

        self.stderr_task = Some(task);
    }

    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        info!("Server process {} exited with {}", pid, status);
                    } else {
                        warn!("Server process {} exited with {}", pid, status);
                    }
                    status.code()
                }
                Err(e) => {
                    error!("Error waiting for server process {}: {}", pid, e);
                    None
                }
            };

            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }

            if let Some(handler) = &exit_handler {
                handler
                    .on_process_exit(ProcessExitEvent {
                        pid: Some(pid),
                        code,
                    })
                    .await;
            }

            trace!("ChildProcessManager: wait task finished for PID {}", pid);
        });

        self.wait_task = Some(task);
    }

    #[cfg(unix)]
    fn signal(pid: u32, mode: StopMode) {
        let signal = match mode {
            StopMode::Graceful => libc::SIGTERM,
            StopMode::Force => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions; a stale pid
        // only yields ESRCH.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            info!("Sent {:?} signal to server process {}", mode, pid);
        } else {
            trace!("Signal to process {} failed, it has likely exited", pid);
        }
    }

    #[cfg(not(unix))]
    fn signal(pid: u32, _mode: StopMode) {
        warn!("Process termination not supported on this platform (pid {})", pid);
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    async fn start(&mut self) -> Result<(), ProcessError> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting server process: {} {:?}", self.command, self.args);

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(working_dir) = &self.working_directory {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Server process started with PID: {}", pid);
        self.set_state(ProcessState::Running { pid });

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio_transport = Some(StdioTransport::new(stdin, stdout));
        self.spawn_stderr_monitor(stderr);
        self.spawn_wait_task(child, pid);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), ProcessError> {
        let pid = self.get_state().pid().ok_or(ProcessError::NotStarted)?;

        // Dropping an unclaimed transport closes stdin first
        self.stdio_transport.take();

        Self::signal(pid, mode);
        if mode == StopMode::Graceful {
            // The wait task moves the state to Stopped once it exits
            return Ok(());
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StdioTransport, ProcessError> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn on_process_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    fn kill_sync(&mut self) {
        let Some(pid) = self.get_state().pid() else {
            return;
        };

        Self::signal(pid, StopMode::Force);
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.set_state(ProcessState::Stopped);
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelExitHandler(mpsc::UnboundedSender<ProcessExitEvent>);

    #[async_trait]
    impl ProcessExitHandler for ChannelExitHandler {
        async fn on_process_exit(&self, event: ProcessExitEvent) {
            let _ = self.0.send(event);
        }
    }

    fn sh(script: &str) -> ChildProcessManager {
        ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            None,
        )
    }

    #[tokio::test]
    async fn test_lifecycle_and_state_transitions() {
        let mut manager = sh("sleep 5");
        assert_eq!(manager.get_state(), ProcessState::NotStarted);

        manager.start().await.unwrap();
        assert!(matches!(manager.get_state(), ProcessState::Running { .. }));
        assert!(matches!(
            manager.start().await,
            Err(ProcessError::AlreadyStarted)
        ));

        manager.stop(StopMode::Force).await.unwrap();
        assert_eq!(manager.get_state(), ProcessState::Stopped);
        assert!(matches!(
            manager.stop(StopMode::Force).await,
            Err(ProcessError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_graceful_stop_waits_for_exit() {
        let mut manager = sh("sleep 30");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_process_exit(Arc::new(ChannelExitHandler(tx)));

        manager.start().await.unwrap();
        manager.stop(StopMode::Graceful).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.code, None);
        assert_eq!(manager.get_state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stderr_lines_reach_handler() {
        let mut manager = sh("echo 'schema not found' >&2; sleep 1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_stderr_line(move |line| {
            let _ = tx.send(line);
        });

        manager.start().await.unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "schema not found");

        manager.stop(StopMode::Force).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_handler_fires_with_exit_code() {
        let mut manager = sh("exit 3");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_process_exit(Arc::new(ChannelExitHandler(tx)));

        manager.start().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.code, Some(3));
        assert!(!event.is_clean());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_exit_handler_fires_on_kill() {
        let mut manager = sh("sleep 30");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_process_exit(Arc::new(ChannelExitHandler(tx)));

        manager.start().await.unwrap();
        manager.kill_sync();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.code, None);
    }

    #[tokio::test]
    async fn test_transport_is_handed_out_once() {
        let mut manager = sh("cat");
        assert!(matches!(
            manager.create_stdio_transport(),
            Err(ProcessError::NotStarted)
        ));

        manager.start().await.unwrap();
        let _transport = manager.create_stdio_transport().unwrap();
        assert!(matches!(
            manager.create_stdio_transport(),
            Err(ProcessError::NotStarted)
        ));

        manager.stop(StopMode::Force).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io_error() {
        let mut manager =
            ChildProcessManager::new("/nonexistent/language-server".to_string(), vec![], None);
        assert!(matches!(manager.start().await, Err(ProcessError::Io(_))));
        assert!(!manager.is_running());
    }

    #[test]
    fn test_process_state_methods() {
        assert!(ProcessState::NotStarted.pid().is_none());
        assert_eq!(ProcessState::Running { pid: 7 }.pid(), Some(7));
        assert!(!ProcessState::Stopped.is_running());
    }
}
