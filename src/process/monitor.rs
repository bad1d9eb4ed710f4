use crate::config::MonitorConfig;
use crate::error::{Result, StokerError};
use crate::events::{EventBus, MonitorEvent};
use crate::process::manager::ProcessManager;
use crate::process::types::{ProcessId, ProcessSummary};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Injectable liveness predicate.
///
/// Receives a snapshot of the process and decides whether it is healthy.
/// The predicate races against the configured timeout; timing out counts
/// as unhealthy.
pub type HealthProbe =
    Arc<dyn Fn(ProcessSummary) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Health check configuration for one process id
#[derive(Clone)]
pub struct HealthCheck {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    /// Defaults to "always healthy" when unset
    pub probe: Option<HealthProbe>,
}

impl HealthCheck {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.health_interval_ms),
            timeout: Duration::from_millis(config.health_timeout_ms),
            retries: config.health_retries,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: HealthProbe) -> Self {
        self.probe = Some(probe);
        self
    }
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("custom_probe", &self.probe.is_some())
            .finish()
    }
}

/// Rolling per-process sample
#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub uptime: Duration,
    pub restarts: u32,
    pub last_health_check: Option<SystemTime>,
    pub last_response_time: Option<Duration>,
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            uptime: Duration::from_secs(0),
            restarts: 0,
            last_health_check: None,
            last_response_time: None,
        }
    }
}

struct MonitorTasks {
    sampler: JoinHandle<()>,
    health: JoinHandle<()>,
}

/// Independent health and resource observation over managed processes.
///
/// Monitoring never terminates or restarts anything; it only emits events
/// for whoever reacts to them.
#[derive(Clone)]
pub struct ProcessMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    manager: ProcessManager,
    config: MonitorConfig,
    system: Mutex<System>,
    metrics: Mutex<HashMap<ProcessId, ProcessMetrics>>,
    tasks: Mutex<HashMap<ProcessId, MonitorTasks>>,
    checks: Mutex<HashMap<ProcessId, HealthCheck>>,
    events: EventBus<MonitorEvent>,
}

impl ProcessMonitor {
    pub fn new(manager: ProcessManager, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                manager,
                config,
                system: Mutex::new(System::new_all()),
                metrics: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                checks: Mutex::new(HashMap::new()),
                events: EventBus::new(256),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Begin periodic resource sampling and health checking for a process.
    ///
    /// No-op (with a warning) if the process is already being monitored.
    pub async fn start_monitoring(&self, id: ProcessId) -> Result<()> {
        if self.inner.manager.summary(id).await.is_none() {
            return Err(StokerError::ProcessNotFound(id.to_string()));
        }

        let mut tasks = self.inner.tasks.lock().await;
        if tasks.contains_key(&id) {
            tracing::warn!("Process {} is already being monitored", id);
            return Ok(());
        }

        self.inner
            .metrics
            .lock()
            .await
            .insert(id, ProcessMetrics::default());

        let monitor = self.clone();
        let sampler = tokio::spawn(async move {
            let period = Duration::from_millis(monitor.inner.config.resource_interval_ms);
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(summary) = monitor.inner.manager.summary(id).await else {
                    break;
                };
                monitor.sample(id, &summary).await;
            }
        });

        let monitor = self.clone();
        let health = tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            loop {
                let check = monitor.check_for(id).await;
                tokio::time::sleep(check.interval).await;
                let Some(summary) = monitor.inner.manager.summary(id).await else {
                    break;
                };
                monitor
                    .run_health_check(id, summary, &check, &mut consecutive_failures)
                    .await;
            }
        });

        tasks.insert(id, MonitorTasks { sampler, health });
        tracing::debug!("Started monitoring process {}", id);
        Ok(())
    }

    /// Cancel sampling and discard metrics for a process
    pub async fn stop_monitoring(&self, id: ProcessId) {
        if let Some(tasks) = self.inner.tasks.lock().await.remove(&id) {
            tasks.sampler.abort();
            tasks.health.abort();
        }
        self.inner.metrics.lock().await.remove(&id);
        self.inner.checks.lock().await.remove(&id);
        tracing::debug!("Stopped monitoring process {}", id);
    }

    pub async fn get_metrics(&self, id: ProcessId) -> Option<ProcessMetrics> {
        self.inner.metrics.lock().await.get(&id).cloned()
    }

    /// Install a custom liveness check for a process id, overriding the
    /// default "always healthy" check
    pub async fn set_health_check(&self, id: ProcessId, check: HealthCheck) {
        self.inner.checks.lock().await.insert(id, check);
    }

    /// Processes currently above either threshold
    pub async fn get_high_resource_processes(
        &self,
        cpu_threshold: f32,
        memory_threshold: f32,
    ) -> Vec<ProcessId> {
        let metrics = self.inner.metrics.lock().await;
        let mut ids: Vec<ProcessId> = metrics
            .iter()
            .filter(|(_, m)| m.cpu_percent > cpu_threshold || m.memory_percent > memory_threshold)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Cancel all monitoring
    pub async fn stop_all(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        for (_, t) in tasks.drain() {
            t.sampler.abort();
            t.health.abort();
        }
        self.inner.metrics.lock().await.clear();
        self.inner.checks.lock().await.clear();
    }

    async fn check_for(&self, id: ProcessId) -> HealthCheck {
        let checks = self.inner.checks.lock().await;
        checks
            .get(&id)
            .cloned()
            .unwrap_or_else(|| HealthCheck::from_config(&self.inner.config))
    }

    async fn sample(&self, id: ProcessId, summary: &ProcessSummary) {
        let (cpu_percent, memory_percent) = match summary.pid {
            Some(pid) => {
                let mut system = self.inner.system.lock().await;
                let sys_pid = Pid::from_u32(pid);
                system.refresh_processes_specifics(
                    sysinfo::ProcessesToUpdate::Some(&[sys_pid]),
                    true,
                    ProcessRefreshKind::everything(),
                );
                system.refresh_memory();
                match system.process(sys_pid) {
                    Some(process) => {
                        let total = system.total_memory().max(1);
                        (
                            process.cpu_usage(),
                            process.memory() as f32 * 100.0 / total as f32,
                        )
                    }
                    None => (0.0, 0.0),
                }
            }
            None => (0.0, 0.0),
        };

        {
            let mut metrics = self.inner.metrics.lock().await;
            if let Some(m) = metrics.get_mut(&id) {
                m.cpu_percent = cpu_percent;
                m.memory_percent = memory_percent;
                m.uptime = summary.uptime;
                m.restarts = summary.restarts;
            }
        }

        let config = &self.inner.config;
        if cpu_percent > config.cpu_alert_threshold {
            tracing::warn!("Process {} CPU at {:.1}%", id, cpu_percent);
            self.inner.events.emit(MonitorEvent::HighCpu {
                id,
                percent: cpu_percent,
            });
        }
        if memory_percent > config.memory_alert_threshold {
            tracing::warn!("Process {} memory at {:.1}%", id, memory_percent);
            self.inner.events.emit(MonitorEvent::HighMemory {
                id,
                percent: memory_percent,
            });
        }
        if summary.restarts > config.frequent_restart_threshold {
            self.inner.events.emit(MonitorEvent::FrequentRestarts {
                id,
                restarts: summary.restarts,
            });
        }
    }

    async fn run_health_check(
        &self,
        id: ProcessId,
        summary: ProcessSummary,
        check: &HealthCheck,
        consecutive_failures: &mut u32,
    ) {
        let started = Instant::now();
        let healthy = match &check.probe {
            Some(probe) => matches!(
                tokio::time::timeout(check.timeout, probe(summary)).await,
                Ok(true)
            ),
            None => true,
        };
        let elapsed = started.elapsed();

        {
            let mut metrics = self.inner.metrics.lock().await;
            if let Some(m) = metrics.get_mut(&id) {
                m.last_health_check = Some(SystemTime::now());
                m.last_response_time = Some(elapsed);
            }
        }

        if elapsed > Duration::from_millis(self.inner.config.slow_response_threshold_ms) {
            self.inner
                .events
                .emit(MonitorEvent::SlowResponse { id, elapsed });
        }

        if healthy {
            *consecutive_failures = 0;
            self.inner.events.emit(MonitorEvent::HealthCheckPassed {
                id,
                response_time: elapsed,
            });
        } else {
            *consecutive_failures += 1;
            tracing::warn!(
                "Health check failed for process {} ({} consecutive)",
                id,
                consecutive_failures
            );
            self.inner.events.emit(MonitorEvent::HealthCheckFailed {
                id,
                consecutive_failures: *consecutive_failures,
            });
            if *consecutive_failures >= check.retries {
                self.inner.events.emit(MonitorEvent::Unhealthy { id });
            }
        }
    }
}
