use crate::config::{CommandSpec, PoolConfig};
use crate::error::{Result, StokerError};
use crate::events::{EventBus, PoolEvent};
use crate::process::manager::ProcessManager;
use crate::process::types::{ProcessId, ProcessState};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

/// A pooled worker handed to a caller by `acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledProcess {
    pub id: ProcessId,
    pub use_count: u64,
}

/// Pool utilization snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub queue_length: usize,
    pub utilization: f32,
}

struct PooledWorker {
    id: ProcessId,
    in_use: bool,
    last_used: Instant,
    use_count: u64,
}

struct PoolState {
    min: usize,
    max: usize,
    workers: Vec<PooledWorker>,
    /// FIFO queue of suspended acquirers
    waiters: VecDeque<oneshot::Sender<Result<PooledProcess>>>,
    /// Slots reserved for spawns in flight, so the bound holds while the
    /// state lock is released
    spawning: usize,
    draining: bool,
}

enum AcquirePlan {
    Spawn,
    Wait(oneshot::Receiver<Result<PooledProcess>>),
}

/// A bounded pool of warm worker processes built on the ProcessManager.
///
/// Callers acquire a worker, talk to it through ProcessCommunication, and
/// release it back. Saturated acquires queue FIFO; release hands a worker
/// straight to the longest waiter without it ever appearing idle.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    manager: ProcessManager,
    spec: CommandSpec,
    config: PoolConfig,
    state: Mutex<PoolState>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    /// Single-flight guard: overlapping maintenance passes are skipped
    maintenance_gate: Mutex<()>,
    events: EventBus<PoolEvent>,
}

impl ProcessPool {
    pub fn new(manager: ProcessManager, spec: CommandSpec, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let state = PoolState {
            min: config.min_size,
            max: config.max_size,
            workers: Vec::new(),
            waiters: VecDeque::new(),
            spawning: 0,
            draining: false,
        };
        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                spec,
                config,
                state: Mutex::new(state),
                maintenance: Mutex::new(None),
                maintenance_gate: Mutex::new(()),
                events: EventBus::new(256),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the minimum worker set and start the maintenance loop
    pub async fn initialize(&self) -> Result<()> {
        let min = {
            let state = self.inner.state.lock().await;
            state.min
        };
        for _ in 0..min {
            {
                self.inner.state.lock().await.spawning += 1;
            }
            self.spawn_reserved().await?;
        }

        let pool = self.clone();
        let period = Duration::from_millis(self.inner.config.maintenance_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; the pool was just built
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = pool.run_maintenance().await {
                    tracing::error!("Pool maintenance failed: {}", e);
                }
            }
        });
        *self.inner.maintenance.lock().await = Some(handle);

        self.inner.events.emit(PoolEvent::Initialized { size: min });
        tracing::info!("Pool initialized with {} warm workers", min);
        Ok(())
    }

    /// Acquire a worker: an idle one immediately, a fresh one below the
    /// size cap, or suspend in the FIFO queue until release or timeout.
    pub async fn acquire(&self) -> Result<PooledProcess> {
        let plan = {
            let mut state = self.inner.state.lock().await;
            if state.draining {
                return Err(StokerError::PoolDraining);
            }

            loop {
                let Some(pos) = state.workers.iter().position(|w| !w.in_use) else {
                    break;
                };
                let wid = state.workers[pos].id;
                let running = matches!(
                    self.inner.manager.summary(wid).await.map(|s| s.state),
                    Some(ProcessState::Running)
                );
                if running {
                    let worker = &mut state.workers[pos];
                    worker.in_use = true;
                    worker.use_count += 1;
                    worker.last_used = Instant::now();
                    return Ok(PooledProcess {
                        id: wid,
                        use_count: worker.use_count,
                    });
                }
                // Dead idle worker; drop it and free its manager slot
                state.workers.remove(pos);
                let _ = self.inner.manager.remove(wid).await;
            }

            if state.workers.len() + state.spawning < state.max {
                state.spawning += 1;
                AcquirePlan::Spawn
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                AcquirePlan::Wait(rx)
            }
        };

        match plan {
            AcquirePlan::Spawn => {
                let id = self.spawn_reserved().await?;
                let mut state = self.inner.state.lock().await;
                let worker = state
                    .workers
                    .iter_mut()
                    .find(|w| w.id == id)
                    .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;
                worker.in_use = true;
                worker.use_count += 1;
                worker.last_used = Instant::now();
                Ok(PooledProcess {
                    id,
                    use_count: worker.use_count,
                })
            }
            AcquirePlan::Wait(rx) => {
                let limit = Duration::from_millis(self.inner.config.acquire_timeout_ms);
                match tokio::time::timeout(limit, rx).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => Err(StokerError::PoolDraining),
                    Err(_) => Err(StokerError::AcquireTimeout(limit)),
                }
            }
        }
    }

    /// Release a worker back to the pool.
    ///
    /// If callers are waiting, the worker goes straight to the longest
    /// waiter, still marked in-use. Marking idle and handing off happen
    /// under one lock so no second caller can slip into the gap.
    pub async fn release(&self, process: &PooledProcess) {
        let mut state = self.inner.state.lock().await;
        let Some(pos) = state.workers.iter().position(|w| w.id == process.id) else {
            tracing::warn!("Released process {} is not in the pool", process.id);
            return;
        };

        while let Some(tx) = state.waiters.pop_front() {
            if tx.is_closed() {
                // Waiter gave up (acquire timeout); try the next one
                continue;
            }
            let worker = &mut state.workers[pos];
            worker.use_count += 1;
            worker.last_used = Instant::now();
            let handoff = PooledProcess {
                id: worker.id,
                use_count: worker.use_count,
            };
            if tx.send(Ok(handoff)).is_ok() {
                return;
            }
        }

        let worker = &mut state.workers[pos];
        worker.in_use = false;
        worker.last_used = Instant::now();
    }

    /// Adjust pool bounds, evicting idle workers above the new maximum and
    /// spawning toward the new minimum.
    pub async fn set_pool_size(&self, min: usize, max: usize) -> Result<()> {
        if max == 0 || min > max {
            return Err(StokerError::ConfigError(format!(
                "invalid pool bounds: min={} max={}",
                min, max
            )));
        }

        let (to_evict, deficit) = {
            let mut state = self.inner.state.lock().await;
            state.min = min;
            state.max = max;

            let mut to_evict = Vec::new();
            let mut idx = 0;
            while state.workers.len() + state.spawning > max && idx < state.workers.len() {
                if !state.workers[idx].in_use {
                    to_evict.push(state.workers.remove(idx).id);
                } else {
                    idx += 1;
                }
            }

            let total = state.workers.len() + state.spawning;
            let deficit = min.saturating_sub(total);
            state.spawning += deficit;
            (to_evict, deficit)
        };

        for wid in to_evict {
            self.retire_worker(wid, true).await;
        }
        for _ in 0..deficit {
            if let Err(e) = self.spawn_reserved().await {
                tracing::warn!("Scale-up spawn failed: {}", e);
            }
        }
        Ok(())
    }

    /// One maintenance pass: prune dead waiters, replace crashed or stopped
    /// workers, evict stale idle workers down to the minimum, and spawn
    /// proactively when callers are queued below the maximum.
    ///
    /// Only one pass runs at a time; overlapping invocations return
    /// immediately.
    pub async fn run_maintenance(&self) -> Result<()> {
        let Ok(_gate) = self.inner.maintenance_gate.try_lock() else {
            tracing::debug!("Maintenance pass already running, skipping");
            return Ok(());
        };

        let mut evicted = 0usize;
        let mut replaced = 0usize;
        let mut spawned = 0usize;

        let mut dead: Vec<ProcessId> = Vec::new();
        let mut stale: Vec<ProcessId> = Vec::new();
        let deficit;
        {
            let mut state = self.inner.state.lock().await;
            if state.draining {
                return Ok(());
            }

            state.waiters.retain(|tx| !tx.is_closed());

            // Workers whose process crashed or stopped under us
            let mut idx = 0;
            while idx < state.workers.len() {
                let wid = state.workers[idx].id;
                let proc_state = self.inner.manager.summary(wid).await.map(|s| s.state);
                match proc_state {
                    Some(ProcessState::Running)
                    | Some(ProcessState::Starting)
                    | Some(ProcessState::Restarting) => idx += 1,
                    _ => {
                        state.workers.remove(idx);
                        dead.push(wid);
                        replaced += 1;
                    }
                }
            }

            // Idle eviction, never below the minimum
            let idle_timeout = Duration::from_millis(self.inner.config.idle_timeout_ms);
            let now = Instant::now();
            let min = state.min;
            let mut idx = 0;
            while idx < state.workers.len() {
                if state.workers.len() + state.spawning <= min {
                    break;
                }
                let worker = &state.workers[idx];
                if !worker.in_use && now.duration_since(worker.last_used) >= idle_timeout {
                    let wid = worker.id;
                    state.workers.remove(idx);
                    stale.push(wid);
                    evicted += 1;
                } else {
                    idx += 1;
                }
            }

            // Respawn what was lost, at least to min, plus one proactive
            // spawn when callers are queued, all within max
            let total = state.workers.len() + state.spawning;
            let mut want = replaced;
            if total + want < state.min {
                want = state.min - total;
            }
            if !state.waiters.is_empty() && total + want < state.max {
                want += 1;
            }
            if total + want > state.max {
                want = state.max.saturating_sub(total);
            }
            deficit = want;
            state.spawning += deficit;
        }

        for wid in dead {
            let _ = self.inner.manager.remove(wid).await;
        }
        for wid in stale {
            tracing::info!("Evicting idle worker {}", wid);
            self.retire_worker(wid, true).await;
        }
        for _ in 0..deficit {
            match self.spawn_reserved().await {
                Ok(id) => {
                    spawned += 1;
                    self.hand_to_waiter(id).await;
                }
                Err(e) => tracing::warn!("Maintenance spawn failed: {}", e),
            }
        }

        self.inner.events.emit(PoolEvent::MaintenanceComplete {
            evicted,
            replaced,
            spawned,
        });
        Ok(())
    }

    /// Stop accepting requests, reject the queue, wait for in-flight
    /// releases up to the destroy timeout, then terminate everything.
    pub async fn drain(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.draining {
                return Ok(());
            }
            state.draining = true;
            while let Some(tx) = state.waiters.pop_front() {
                let _ = tx.send(Err(StokerError::PoolDraining));
            }
        }

        if let Some(handle) = self.inner.maintenance.lock().await.take() {
            handle.abort();
        }

        let limit = Duration::from_millis(self.inner.config.destroy_timeout_ms);
        let deadline = Instant::now() + limit;
        let mut timed_out = false;
        loop {
            let busy = {
                let state = self.inner.state.lock().await;
                state.workers.iter().any(|w| w.in_use)
            };
            if !busy {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Drain timed out with workers in use, terminating anyway");
                timed_out = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let ids: Vec<ProcessId> = {
            let mut state = self.inner.state.lock().await;
            state.workers.drain(..).map(|w| w.id).collect()
        };

        let mut handles = Vec::with_capacity(ids.len());
        for wid in ids {
            let pool = self.clone();
            let graceful = !timed_out;
            handles.push(tokio::spawn(async move {
                pool.retire_worker(wid, graceful).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.inner.events.emit(PoolEvent::Drained);
        tracing::info!("Pool drained");
        Ok(())
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let total = state.workers.len();
        let in_use = state.workers.iter().filter(|w| w.in_use).count();
        PoolStats {
            total,
            available: total - in_use,
            in_use,
            queue_length: state.waiters.iter().filter(|tx| !tx.is_closed()).count(),
            utilization: if state.max == 0 {
                0.0
            } else {
                in_use as f32 * 100.0 / state.max as f32
            },
        }
    }

    /// Spawn one worker for a slot the caller already reserved in
    /// `state.spawning`; the reservation is returned on either path.
    async fn spawn_reserved(&self) -> Result<ProcessId> {
        let result = self.inner.manager.spawn(self.inner.spec.clone()).await;
        let mut state = self.inner.state.lock().await;
        state.spawning = state.spawning.saturating_sub(1);
        match result {
            Ok(id) => {
                if state.draining {
                    // Lost the race against drain; don't leak the worker
                    drop(state);
                    self.retire_worker(id, true).await;
                    return Err(StokerError::PoolDraining);
                }
                state.workers.push(PooledWorker {
                    id,
                    in_use: false,
                    last_used: Instant::now(),
                    use_count: 0,
                });
                Ok(id)
            }
            Err(e) => {
                tracing::warn!("Worker spawn failed: {}", e);
                Err(e)
            }
        }
    }

    /// Give a freshly spawned worker to the longest waiter, if any
    async fn hand_to_waiter(&self, id: ProcessId) {
        let mut state = self.inner.state.lock().await;
        let Some(pos) = state.workers.iter().position(|w| w.id == id) else {
            return;
        };
        if state.workers[pos].in_use {
            return;
        }
        while let Some(tx) = state.waiters.pop_front() {
            if tx.is_closed() {
                continue;
            }
            let worker = &mut state.workers[pos];
            worker.in_use = true;
            worker.use_count += 1;
            worker.last_used = Instant::now();
            let handoff = PooledProcess {
                id: worker.id,
                use_count: worker.use_count,
            };
            if tx.send(Ok(handoff)).is_ok() {
                return;
            }
            worker.in_use = false;
        }
    }

    async fn retire_worker(&self, id: ProcessId, graceful: bool) {
        if let Err(e) = self.inner.manager.terminate(id, graceful).await {
            tracing::error!("Failed to terminate pooled worker {}: {}", id, e);
        }
        let _ = self.inner.manager.remove(id).await;
    }
}
