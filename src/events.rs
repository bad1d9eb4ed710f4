use crate::process::types::{ExitInfo, ProcessId};
use std::time::Duration;
use tokio::sync::broadcast;

/// Fan-out channel for component events.
///
/// Every subscriber gets its own receiver; a slow or dropped subscriber
/// cannot affect delivery to the others. Emitting with no subscribers is
/// not an error.
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Lifecycle and I/O events emitted by the ProcessManager
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Process reached the running state
    Started { id: ProcessId, pid: u32 },
    /// Process exited; emitted exactly once per incarnation
    Exited { id: ProcessId, exit: ExitInfo },
    /// A process-local error (spawn failure, stdin write failure, ...)
    Error { id: ProcessId, message: String },
    /// Raw bytes read from the process's stdout
    Stdout { id: ProcessId, data: Vec<u8> },
    /// Raw bytes read from the process's stderr
    Stderr { id: ProcessId, data: Vec<u8> },
    /// A crash restart was scheduled after a backoff delay
    RestartScheduled {
        id: ProcessId,
        attempt: u32,
        delay: Duration,
    },
    /// The restart budget is exhausted; the process stays crashed
    MaxRestartsExceeded { id: ProcessId },
    /// The manager terminated everything and cleared its tracking
    Cleanup,
}

/// Health and resource events emitted by the ProcessMonitor
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    HealthCheckPassed {
        id: ProcessId,
        response_time: Duration,
    },
    HealthCheckFailed {
        id: ProcessId,
        consecutive_failures: u32,
    },
    /// Fired once consecutive failures exceed the configured retry count
    Unhealthy { id: ProcessId },
    HighCpu { id: ProcessId, percent: f32 },
    HighMemory { id: ProcessId, percent: f32 },
    SlowResponse { id: ProcessId, elapsed: Duration },
    FrequentRestarts { id: ProcessId, restarts: u32 },
}

/// Pool lifecycle events emitted by the ProcessPool
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Initialized { size: usize },
    Drained,
    MaintenanceComplete {
        evicted: usize,
        replaced: usize,
        spawned: usize,
    },
}
