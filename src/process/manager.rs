use crate::config::{CommandSpec, ManagerConfig};
use crate::error::{Result, StokerError};
use crate::events::{EventBus, ProcessEvent};
use crate::process::restart::BackoffPolicy;
use crate::process::spawner::{spawn_child, SpawnedChild};
use crate::process::types::{ExitInfo, ManagedProcess, ProcessId, ProcessState, ProcessSummary};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};

/// Owns spawning, state tracking, termination and crash-driven restart of
/// OS processes. All other components interact with a process through its
/// id; the raw child handle never leaves this module.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    backoff: BackoffPolicy,
    processes: Mutex<HashMap<ProcessId, ManagedProcess>>,
    next_id: AtomicU64,
    events: EventBus<ProcessEvent>,
}

impl ProcessManager {
    pub fn new(config: ManagerConfig) -> Self {
        let backoff = BackoffPolicy::from_config(&config);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                backoff,
                processes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events: EventBus::new(1024),
            }),
        }
    }

    /// Subscribe to lifecycle and raw-output events
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Spawn a new managed process.
    ///
    /// Fails with a capacity error when the tracked-process cap is reached.
    /// Exit, stdout and stderr handlers are registered before this returns.
    /// If the OS spawn itself fails the process is recorded as crashed and
    /// the error is returned to the caller.
    pub async fn spawn(&self, spec: CommandSpec) -> Result<ProcessId> {
        let mut processes = self.inner.processes.lock().await;

        if processes.len() >= self.inner.config.max_processes {
            return Err(StokerError::CapacityExceeded(processes.len()));
        }

        let id = ProcessId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let max_restarts = spec
            .options
            .max_restarts
            .unwrap_or(self.inner.config.max_restarts);
        let mut process = ManagedProcess::new(id, spec, max_restarts);

        match spawn_child(&process.spec) {
            Ok(spawned) => {
                self.attach_child(&mut process, spawned);
                processes.insert(id, process);
                Ok(id)
            }
            Err(e) => {
                let message = e.to_string();
                process.state = ProcessState::Crashed;
                process.last_error = Some(message.clone());
                processes.insert(id, process);
                self.inner.events.emit(ProcessEvent::Error { id, message });
                Err(e)
            }
        }
    }

    /// Terminate a process. Idempotent if it is already stopped.
    ///
    /// Cancels any pending restart timer first, so an intentionally stopped
    /// process is never simultaneously auto-restarted. With `graceful` the
    /// process gets SIGTERM and the grace window before SIGKILL; without it
    /// SIGKILL is sent immediately.
    pub async fn terminate(&self, id: ProcessId, graceful: bool) -> Result<()> {
        let (pid, exit_rx) = {
            let mut processes = self.inner.processes.lock().await;
            let process = processes
                .get_mut(&id)
                .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;

            process.cancel_timers();

            match (process.state, process.pid) {
                (ProcessState::Stopped, _) => return Ok(()),
                (_, None) => {
                    // Crashed or mid-restart without a live child
                    process.state = ProcessState::Stopped;
                    return Ok(());
                }
                (_, Some(pid)) => {
                    process.state = ProcessState::Stopping;
                    (pid, process.exit_rx.clone())
                }
            }
        };

        self.signal_and_wait(id, pid, exit_rx, graceful).await
    }

    #[cfg(unix)]
    async fn signal_and_wait(
        &self,
        id: ProcessId,
        pid: u32,
        exit_rx: watch::Receiver<Option<ExitInfo>>,
        graceful: bool,
    ) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let grace = self.inner.config.grace_timeout();
        let nix_pid = Pid::from_raw(pid as i32);
        let first = if graceful {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };

        tracing::info!("Stopping process {} (pid {}) with {}", id, pid, first);
        if let Err(e) = signal::kill(nix_pid, first) {
            if e != Errno::ESRCH {
                return Err(StokerError::StopError(
                    id.to_string(),
                    format!("Failed to send {}: {}", first, e),
                ));
            }
        }

        if wait_for_exit(exit_rx.clone(), grace).await.is_some() {
            return Ok(());
        }

        tracing::warn!(
            "Process {} did not exit within {:?}, sending SIGKILL",
            id,
            grace
        );
        if let Err(e) = signal::kill(nix_pid, Signal::SIGKILL) {
            if e != Errno::ESRCH {
                return Err(StokerError::StopError(
                    id.to_string(),
                    format!("Failed to send SIGKILL: {}", e),
                ));
            }
        }

        match wait_for_exit(exit_rx, grace).await {
            Some(_) => Ok(()),
            None => Err(StokerError::StopError(
                id.to_string(),
                "Process survived SIGKILL".to_string(),
            )),
        }
    }

    #[cfg(not(unix))]
    async fn signal_and_wait(
        &self,
        _id: ProcessId,
        _pid: u32,
        _exit_rx: watch::Receiver<Option<ExitInfo>>,
        _graceful: bool,
    ) -> Result<()> {
        Err(StokerError::SignalError(
            "Process termination is only supported on Unix".to_string(),
        ))
    }

    /// Gracefully terminate and respawn a process with identical
    /// command/args/options. The restart count is cumulative.
    pub async fn restart(&self, id: ProcessId) -> Result<()> {
        {
            let processes = self.inner.processes.lock().await;
            if !processes.contains_key(&id) {
                return Err(StokerError::ProcessNotFound(id.to_string()));
            }
        }

        self.terminate(id, true).await?;

        let spec = {
            let mut processes = self.inner.processes.lock().await;
            let process = processes
                .get_mut(&id)
                .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;
            process.state = ProcessState::Restarting;
            process.spec.clone()
        };

        match spawn_child(&spec) {
            Ok(spawned) => {
                let mut processes = self.inner.processes.lock().await;
                let process = processes
                    .get_mut(&id)
                    .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;
                process.restarts += 1;
                self.attach_child(process, spawned);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let mut processes = self.inner.processes.lock().await;
                if let Some(process) = processes.get_mut(&id) {
                    process.state = ProcessState::Crashed;
                    process.last_error = Some(message.clone());
                }
                self.inner.events.emit(ProcessEvent::Error { id, message });
                Err(e)
            }
        }
    }

    /// Read-only snapshot of every tracked process
    pub async fn list_processes(&self) -> Vec<ProcessSummary> {
        let processes = self.inner.processes.lock().await;
        let mut summaries: Vec<ProcessSummary> = processes.values().map(|p| p.summary()).collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    pub async fn summary(&self, id: ProcessId) -> Option<ProcessSummary> {
        let processes = self.inner.processes.lock().await;
        processes.get(&id).map(|p| p.summary())
    }

    pub async fn process_count(&self) -> usize {
        self.inner.processes.lock().await.len()
    }

    /// Drop a stopped or crashed process from tracking, freeing capacity
    pub async fn remove(&self, id: ProcessId) -> Result<()> {
        let mut processes = self.inner.processes.lock().await;
        let process = processes
            .get_mut(&id)
            .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;

        match process.state {
            ProcessState::Stopped | ProcessState::Crashed => {
                process.cancel_timers();
                processes.remove(&id);
                Ok(())
            }
            other => Err(StokerError::StopError(
                id.to_string(),
                format!("cannot remove a {} process", other),
            )),
        }
    }

    /// Terminate every tracked process (best effort, concurrently) and
    /// clear all tracking. Used at shutdown.
    pub async fn cleanup(&self) {
        let ids: Vec<ProcessId> = {
            let processes = self.inner.processes.lock().await;
            processes.keys().copied().collect()
        };

        tracing::info!("Cleaning up {} tracked processes", ids.len());

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = manager.terminate(id, true).await {
                    tracing::error!("Failed to stop process {}: {}", id, e);
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let mut processes = self.inner.processes.lock().await;
        for process in processes.values_mut() {
            process.cancel_timers();
        }
        processes.clear();
        self.inner.events.emit(ProcessEvent::Cleanup);
    }

    /// Queue bytes for the process's stdin.
    ///
    /// Fails when the process is unknown or its input stream is gone.
    pub async fn write_stdin(&self, id: ProcessId, data: Vec<u8>) -> Result<()> {
        let tx = {
            let processes = self.inner.processes.lock().await;
            let process = processes
                .get(&id)
                .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;
            process
                .stdin_tx
                .clone()
                .ok_or_else(|| StokerError::StdinUnavailable(id.to_string()))?
        };

        tx.send(data)
            .await
            .map_err(|_| StokerError::StdinUnavailable(id.to_string()))
    }

    /// Register a lossless consumer for the process's stdout bytes.
    ///
    /// The tap survives restarts of the same process id. Broadcast events
    /// still carry the same bytes for advisory consumers.
    pub async fn register_output_tap(
        &self,
        id: ProcessId,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let tap = {
            let processes = self.inner.processes.lock().await;
            let process = processes
                .get(&id)
                .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;
            Arc::clone(&process.output_tap)
        };

        *tap.lock().await = Some(tx);
        Ok(())
    }

    /// Wire up I/O tasks and the exit watcher for a freshly spawned child,
    /// then mark the process running. Called with the process table locked;
    /// spawns tasks but never awaits.
    fn attach_child(&self, process: &mut ManagedProcess, mut spawned: SpawnedChild) {
        let id = process.id;
        let pid = spawned.pid;

        process.state = ProcessState::Starting;
        process.pid = Some(pid);
        process.started_at = SystemTime::now();

        // Stdin writer task owns the input handle for this incarnation
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(mut stdin) = spawned.child.stdin.take() {
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                while let Some(buf) = stdin_rx.recv().await {
                    if let Err(e) = stdin.write_all(&buf).await {
                        events.emit(ProcessEvent::Error {
                            id,
                            message: format!("stdin write failed: {}", e),
                        });
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }
        process.stdin_tx = Some(stdin_tx);

        // Stdout reader: lossless tap first, advisory event second
        if let Some(mut stdout) = spawned.child.stdout.take() {
            let tap = Arc::clone(&process.output_tap);
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let data = buf[..n].to_vec();
                            {
                                let mut guard = tap.lock().await;
                                if let Some(tx) = guard.as_ref() {
                                    if tx.send(data.clone()).await.is_err() {
                                        *guard = None;
                                    }
                                }
                            }
                            events.emit(ProcessEvent::Stdout { id, data });
                        }
                    }
                }
            });
        }

        // Stderr reader
        if let Some(mut stderr) = spawned.child.stderr.take() {
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            events.emit(ProcessEvent::Stderr {
                                id,
                                data: buf[..n].to_vec(),
                            });
                        }
                    }
                }
            });
        }

        // Exit watcher owns the child handle itself
        let (exit_tx, exit_rx) = watch::channel(None);
        process.exit_rx = exit_rx;
        let manager = self.clone();
        let mut child = spawned.child;
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    signal: exit_signal(&status),
                },
                Err(e) => {
                    tracing::error!("Wait failed for process {}: {}", id, e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            manager.handle_exit(id, info).await;
            exit_tx.send_replace(Some(info));
        });

        // Per-spawn timeout escalates straight to a kill
        if let Some(timeout_ms) = process.spec.options.timeout_ms {
            let manager = self.clone();
            process.kill_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                tracing::warn!("Process {} exceeded its {}ms timeout, killing", id, timeout_ms);
                let _ = manager.terminate(id, false).await;
            }));
        }

        process.state = ProcessState::Running;
        self.inner.events.emit(ProcessEvent::Started { id, pid });
        tracing::info!(
            "Process {} started: {} (pid {})",
            id,
            process.spec.command,
            pid
        );
    }

    /// Exit watcher callback: transition state and, on a crash, schedule a
    /// backoff-delayed restart within the process's budget.
    async fn handle_exit(&self, id: ProcessId, info: ExitInfo) {
        let mut processes = self.inner.processes.lock().await;
        let Some(process) = processes.get_mut(&id) else {
            return;
        };

        if let Some(timer) = process.kill_timer.take() {
            timer.abort();
        }
        process.pid = None;
        process.stdin_tx = None;

        self.inner.events.emit(ProcessEvent::Exited { id, exit: info });
        tracing::debug!(
            "Process {} exited (code: {:?}, signal: {:?})",
            id,
            info.code,
            info.signal
        );

        match process.state {
            ProcessState::Stopping => {
                process.state = ProcessState::Stopped;
            }
            ProcessState::Starting | ProcessState::Running => {
                if info.clean() {
                    process.state = ProcessState::Stopped;
                } else {
                    process.state = ProcessState::Crashed;
                    process.last_error = Some(describe_exit(&info));
                    self.schedule_restart(process);
                }
            }
            _ => {}
        }
    }

    fn schedule_restart(&self, process: &mut ManagedProcess) {
        let id = process.id;

        if !self
            .inner
            .backoff
            .should_restart(process.restarts, process.max_restarts)
        {
            tracing::warn!(
                "Process {} exhausted its restart budget ({}), giving up",
                id,
                process.max_restarts
            );
            self.inner
                .events
                .emit(ProcessEvent::MaxRestartsExceeded { id });
            return;
        }

        let attempt = process.restarts;
        let delay = self.inner.backoff.delay_for(attempt);
        self.inner.events.emit(ProcessEvent::RestartScheduled {
            id,
            attempt: attempt + 1,
            delay,
        });
        tracing::info!(
            "Scheduling restart {} of process {} in {:?}",
            attempt + 1,
            id,
            delay
        );

        let manager = self.clone();
        process.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.respawn_crashed(id).await;
        }));
    }

    /// Restart-timer callback. Bails out if the process was terminated or
    /// removed while the timer was pending.
    async fn respawn_crashed(&self, id: ProcessId) {
        let spec = {
            let mut processes = self.inner.processes.lock().await;
            let Some(process) = processes.get_mut(&id) else {
                return;
            };
            if process.state != ProcessState::Crashed {
                return;
            }
            process.state = ProcessState::Restarting;
            process.restart_timer = None;
            process.spec.clone()
        };

        match spawn_child(&spec) {
            Ok(spawned) => {
                let mut processes = self.inner.processes.lock().await;
                let Some(process) = processes.get_mut(&id) else {
                    reap_orphan(spawned);
                    return;
                };
                if process.state != ProcessState::Restarting {
                    // Terminated while we were spawning
                    reap_orphan(spawned);
                    return;
                }
                process.restarts += 1;
                self.attach_child(process, spawned);
            }
            Err(e) => {
                let message = e.to_string();
                let mut processes = self.inner.processes.lock().await;
                let Some(process) = processes.get_mut(&id) else {
                    return;
                };
                process.restarts += 1;
                process.state = ProcessState::Crashed;
                process.last_error = Some(message.clone());
                self.inner.events.emit(ProcessEvent::Error { id, message });
                self.schedule_restart(process);
            }
        }
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

async fn wait_for_exit(
    mut rx: watch::Receiver<Option<ExitInfo>>,
    limit: Duration,
) -> Option<ExitInfo> {
    let wait = async {
        loop {
            if let Some(info) = *rx.borrow() {
                return info;
            }
            if rx.changed().await.is_err() {
                // Watcher gone without reporting; the child is not coming back
                return ExitInfo {
                    code: None,
                    signal: None,
                };
            }
        }
    };
    tokio::time::timeout(limit, wait).await.ok()
}

fn reap_orphan(mut spawned: SpawnedChild) {
    tokio::spawn(async move {
        let _ = spawned.child.start_kill();
        let _ = spawned.child.wait().await;
    });
}

fn describe_exit(info: &ExitInfo) -> String {
    match (info.code, info.signal) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        (None, None) => "exited without status".to_string(),
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
