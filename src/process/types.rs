use crate::config::CommandSpec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Unique identifier for a managed process.
///
/// Assigned monotonically by the manager and never reused, even after the
/// process terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl ProcessId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state in the lifecycle.
///
/// Starting -> Running -> (Stopping -> Stopped) | Crashed -> Restarting -> Starting.
/// Stopped, and Crashed once the restart budget is spent, are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Restarting,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Crashed => write!(f, "crashed"),
            ProcessState::Restarting => write!(f, "restarting"),
        }
    }
}

/// How a process incarnation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Read-only snapshot of a managed process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub id: ProcessId,
    pub command: String,
    pub args: Vec<String>,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub uptime: Duration,
    pub restarts: u32,
    pub last_error: Option<String>,
}

/// Registration point for a lossless stdout consumer.
///
/// The stdout reader task forwards every chunk into the registered sender
/// before (also) broadcasting it as an advisory event, so a communication
/// layer attached here never loses bytes to broadcast lag.
pub(crate) type OutputTap = Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>;

/// Identity and lifecycle record for one OS process.
///
/// Owned exclusively by the ProcessManager; all raw handles (stdin writer,
/// timers, the child itself inside the exit watcher) hang off this record
/// and die with it.
pub(crate) struct ManagedProcess {
    pub id: ProcessId,
    pub spec: CommandSpec,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: SystemTime,
    pub restarts: u32,
    pub max_restarts: u32,
    pub last_error: Option<String>,
    /// Channel into the stdin writer task for the current incarnation
    pub stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Survives restarts so an attached communication layer keeps working
    pub output_tap: OutputTap,
    /// Observed exit of the current incarnation (None while running)
    pub exit_rx: watch::Receiver<Option<ExitInfo>>,
    /// Pending backoff restart; aborted by explicit termination
    pub restart_timer: Option<JoinHandle<()>>,
    /// Pending per-spawn timeout kill; aborted when the process exits
    pub kill_timer: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    pub fn new(id: ProcessId, spec: CommandSpec, max_restarts: u32) -> Self {
        // Placeholder exit channel until a child is attached
        let (_tx, exit_rx) = watch::channel(None);
        Self {
            id,
            spec,
            state: ProcessState::Starting,
            pid: None,
            started_at: SystemTime::now(),
            restarts: 0,
            max_restarts,
            last_error: None,
            stdin_tx: None,
            output_tap: Arc::new(Mutex::new(None)),
            exit_rx,
            restart_timer: None,
            kill_timer: None,
        }
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or(Duration::from_secs(0))
    }

    pub fn summary(&self) -> ProcessSummary {
        ProcessSummary {
            id: self.id,
            command: self.spec.command.clone(),
            args: self.spec.args.clone(),
            state: self.state,
            pid: self.pid,
            uptime: self.uptime(),
            restarts: self.restarts,
            last_error: self.last_error.clone(),
        }
    }

    /// Abort any timers still scheduled for this process
    pub fn cancel_timers(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.kill_timer.take() {
            timer.abort();
        }
    }
}
