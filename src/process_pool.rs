//! Bounded pool of reusable rendering-engine processes
//!
//! Handles are lent exclusively for one conversion through a [`ProcessLease`]
//! and come back to the pool when the lease is released or dropped. A
//! background sweep evicts handles that are dead or idle past
//! `idle_timeout`. The capacity check and the slot reservation for a new
//! launch happen under a single async mutex, so concurrent `acquire` calls
//! can never push the pool past `max_instances`.

use crate::config::PoolConfig;
use crate::engine::{EngineLauncher, EngineSession, EVENT_DISCONNECTED};
use crate::{CancellationSignal, ConvertError, Metrics, PressureLevel, PressureMonitor};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Public view of one pooled engine process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: usize,
    pub endpoint: String,
    pub launch_time: DateTime<Utc>,
    pub active: bool,
}

struct PooledProcess {
    id: usize,
    session: Arc<dyn EngineSession>,
    endpoint: String,
    launch_time: DateTime<Utc>,
    last_used: Instant,
    active: bool,
    uses: usize,
    disconnected: Arc<AtomicBool>,
    watcher: tokio::task::JoinHandle<()>,
}

impl PooledProcess {
    fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            id: self.id,
            endpoint: self.endpoint.clone(),
            launch_time: self.launch_time,
            active: self.active,
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    async fn shutdown(self) {
        self.watcher.abort();
        self.session.close().await;
    }
}

#[derive(Default)]
struct PoolState {
    processes: Vec<PooledProcess>,
    next_id: usize,
    closed: bool,
}

/// Releases a reserved launch slot however the launch ends, including when
/// the acquiring future is dropped mid-launch.
struct PendingSlot<'a>(&'a AtomicUsize);

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

enum Reservation {
    Reuse(ProcessLease),
    Launch(usize),
    Full,
}

struct PoolInner {
    state: Mutex<PoolState>,
    launcher: Arc<dyn EngineLauncher>,
    config: PoolConfig,
    pressure: Option<Arc<PressureMonitor>>,
    metrics: Arc<Metrics>,
    pending_launches: AtomicUsize,
    total_launches: AtomicUsize,
    launch_failures: AtomicUsize,
    total_evictions: AtomicUsize,
    total_uses: AtomicUsize,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// An engine process lent for the duration of one conversion.
///
/// Dropping the lease returns the process to the pool, so a cancelled or
/// panicking conversion never leaks a handle.
pub struct ProcessLease {
    handle: ProcessHandle,
    session: Arc<dyn EngineSession>,
    pool: Arc<PoolInner>,
    healthy: bool,
    returned: bool,
}

impl ProcessLease {
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn session(&self) -> &Arc<dyn EngineSession> {
        &self.session
    }

    /// The transport failed mid-conversion; evict instead of reusing.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

impl Drop for ProcessLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let pool = self.pool.clone();
        let instance_id = self.handle.id;
        let healthy = self.healthy;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    pool.return_process(instance_id, healthy).await;
                });
            }
            Err(_) => warn!("Process {} dropped outside a runtime; not returned", instance_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessPoolStats {
    pub total_instances: usize,
    pub active_instances: usize,
    pub idle_instances: usize,
    pub pending_launches: usize,
    pub max_instances: usize,
    pub total_launches: usize,
    pub launch_failures: usize,
    pub total_evictions: usize,
    pub total_uses: usize,
}

#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        Self::with_monitoring(config, launcher, None, Arc::new(Metrics::new()))
    }

    pub fn with_monitoring(
        config: PoolConfig,
        launcher: Arc<dyn EngineLauncher>,
        pressure: Option<Arc<PressureMonitor>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                launcher,
                config,
                pressure,
                metrics,
                pending_launches: AtomicUsize::new(0),
                total_launches: AtomicUsize::new(0),
                launch_failures: AtomicUsize::new(0),
                total_evictions: AtomicUsize::new(0),
                total_uses: AtomicUsize::new(0),
                sweeper: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn launcher(&self) -> &Arc<dyn EngineLauncher> {
        &self.inner.launcher
    }

    /// Start the recurring idle sweep. Calling it again is a no-op.
    pub fn spawn_sweeper(&self) {
        let mut sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sweeper.is_some() {
            return;
        }

        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = inner.sweep_idle().await;
                if evicted > 0 {
                    debug!("Idle sweep evicted {} engine process(es)", evicted);
                }
            }
        }));
    }

    /// Borrow a process, launching one if the pool has room.
    pub async fn acquire(&self, cancel: &CancellationSignal) -> Result<ProcessLease, ConvertError> {
        let mut swept = false;
        loop {
            if cancel.is_cancelled() {
                return Err(ConvertError::Cancelled);
            }

            let reservation = {
                let mut state = self.inner.state.lock().await;
                self.inner.reserve(&mut state)?
            };

            match reservation {
                Reservation::Reuse(lease) => {
                    debug!("Reusing engine process {}", lease.handle.id);
                    return Ok(lease);
                }
                Reservation::Launch(id) => match self.inner.launch(id, cancel).await {
                    Ok(lease) => return Ok(lease),
                    Err(ConvertError::LaunchFailed(reason)) if !swept => {
                        warn!("Engine launch failed ({}); sweeping and retrying once", reason);
                        swept = true;
                        self.inner.sweep_idle().await;
                    }
                    Err(e) => return Err(e),
                },
                Reservation::Full if !swept => {
                    swept = true;
                    self.inner.sweep_idle().await;
                }
                Reservation::Full => {
                    return Err(ConvertError::PoolExhausted {
                        max_instances: self.inner.config.max_instances,
                    });
                }
            }
        }
    }

    /// Return a lease to the pool and mark its process idle.
    pub async fn release(&self, mut lease: ProcessLease) {
        lease.returned = true;
        self.inner.return_process(lease.handle.id, lease.healthy).await;
    }

    /// Evict dead and idle-expired processes now. Returns how many were evicted.
    pub async fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle().await
    }

    /// Close every process and refuse further acquisitions. Idempotent.
    pub async fn cleanup(&self) {
        if let Some(task) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }

        let processes = {
            let mut state = self.inner.state.lock().await;
            if state.closed && state.processes.is_empty() {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.processes)
        };

        info!("Shutting down process pool ({} processes)...", processes.len());
        for process in processes {
            process.shutdown().await;
        }
        self.inner.metrics.record_pool_usage(0, 0);
        info!("Process pool shutdown complete");
    }

    pub async fn handles(&self) -> Vec<ProcessHandle> {
        let state = self.inner.state.lock().await;
        state.processes.iter().map(PooledProcess::handle).collect()
    }

    pub async fn get_stats(&self) -> ProcessPoolStats {
        let state = self.inner.state.lock().await;
        let active = state.processes.iter().filter(|p| p.active).count();

        ProcessPoolStats {
            total_instances: state.processes.len(),
            active_instances: active,
            idle_instances: state.processes.len() - active,
            pending_launches: self.inner.pending_launches.load(Ordering::Relaxed),
            max_instances: self.inner.config.max_instances,
            total_launches: self.inner.total_launches.load(Ordering::Relaxed),
            launch_failures: self.inner.launch_failures.load(Ordering::Relaxed),
            total_evictions: self.inner.total_evictions.load(Ordering::Relaxed),
            total_uses: self.inner.total_uses.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    fn under_critical_pressure(&self) -> bool {
        self.pressure
            .as_ref()
            .map(|p| p.check() == PressureLevel::Critical)
            .unwrap_or(false)
    }

    /// Capacity check and slot reservation; the caller holds the state lock.
    fn reserve(self: &Arc<Self>, state: &mut PoolState) -> Result<Reservation, ConvertError> {
        if state.closed {
            return Err(ConvertError::BackendUnavailable(
                "process pool is shut down".to_string(),
            ));
        }

        if self.config.reuse_instances {
            if let Some(process) = state
                .processes
                .iter_mut()
                .find(|p| !p.active && !p.is_disconnected())
            {
                process.active = true;
                process.last_used = Instant::now();
                process.uses += 1;
                self.total_uses.fetch_add(1, Ordering::Relaxed);
                return Ok(Reservation::Reuse(ProcessLease {
                    handle: process.handle(),
                    session: process.session.clone(),
                    pool: self.clone(),
                    healthy: true,
                    returned: false,
                }));
            }
        }

        let pending = self.pending_launches.load(Ordering::Relaxed);
        if state.processes.len() + pending >= self.config.max_instances {
            return Ok(Reservation::Full);
        }
        if self.under_critical_pressure() {
            warn!("Memory pressure critical; not launching a new engine process");
            return Ok(Reservation::Full);
        }

        self.pending_launches.fetch_add(1, Ordering::Relaxed);
        let id = state.next_id;
        state.next_id += 1;
        Ok(Reservation::Launch(id))
    }

    async fn launch(
        self: &Arc<Self>,
        id: usize,
        cancel: &CancellationSignal,
    ) -> Result<ProcessLease, ConvertError> {
        let _slot = PendingSlot(&self.pending_launches);
        let timeout = self.config.launch_timeout;
        // Losing either race drops the launch future, which tears down the
        // half-started process.
        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConvertError::Cancelled),
            result = tokio::time::timeout(timeout, self.launcher.launch(id)) => {
                result.unwrap_or(Err(ConvertError::Timeout(timeout)))
            }
        };

        let mut state = self.state.lock().await;

        let session = match launched {
            Ok(session) => session,
            Err(e) => {
                self.launch_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_pool_launch(false);
                error!("Failed to launch engine process {}: {}", id, e);
                return Err(e);
            }
        };

        if state.closed {
            drop(state);
            session.close().await;
            return Err(ConvertError::BackendUnavailable(
                "process pool is shut down".to_string(),
            ));
        }

        let disconnected = Arc::new(AtomicBool::new(false));
        let mut subscription = session.events().subscribe(EVENT_DISCONNECTED);
        let flag = disconnected.clone();
        let watcher = tokio::spawn(async move {
            if subscription.recv().await.is_some() {
                warn!("Engine process {} disconnected", id);
                flag.store(true, Ordering::Relaxed);
            }
        });

        let process = PooledProcess {
            id,
            endpoint: session.endpoint(),
            session: session.clone(),
            launch_time: Utc::now(),
            last_used: Instant::now(),
            active: true,
            uses: 1,
            disconnected,
            watcher,
        };
        let handle = process.handle();
        state.processes.push(process);

        self.total_launches.fetch_add(1, Ordering::Relaxed);
        self.total_uses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_pool_launch(true);
        self.record_usage(&state);
        info!(
            "Engine process {} launched ({}/{})",
            id,
            state.processes.len(),
            self.config.max_instances
        );

        Ok(ProcessLease {
            handle,
            session,
            pool: self.clone(),
            healthy: true,
            returned: false,
        })
    }

    async fn return_process(&self, id: usize, healthy: bool) {
        let mut state = self.state.lock().await;
        let Some(position) = state.processes.iter().position(|p| p.id == id) else {
            return;
        };

        let evict = !healthy || !self.config.reuse_instances || state.closed;
        if evict {
            let process = state.processes.remove(position);
            self.record_usage(&state);
            drop(state);
            if !healthy {
                warn!("Evicting unhealthy engine process {}", id);
            }
            self.total_evictions.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_pool_evictions(1);
            process.shutdown().await;
        } else {
            let process = &mut state.processes[position];
            process.active = false;
            process.last_used = Instant::now();
            self.record_usage(&state);
        }
    }

    async fn sweep_idle(&self) -> usize {
        let candidates: Vec<(usize, Arc<dyn EngineSession>)> = {
            let state = self.state.lock().await;
            state
                .processes
                .iter()
                .filter(|p| !p.active)
                .map(|p| (p.id, p.session.clone()))
                .collect()
        };

        // Liveness probes run without the pool lock held.
        let mut dead = HashSet::new();
        for (id, session) in candidates {
            if !session.is_alive().await {
                dead.insert(id);
            }
        }

        let evicted: Vec<PooledProcess> = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let idle_timeout = self.config.idle_timeout;
            let (evicted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.processes)
                .into_iter()
                .partition(|p| {
                    !p.active
                        && (dead.contains(&p.id)
                            || p.is_disconnected()
                            || now.duration_since(p.last_used) >= idle_timeout)
                });
            state.processes = kept;
            self.record_usage(&state);
            evicted
        };

        let count = evicted.len();
        for process in evicted {
            debug!(
                "Evicting engine process {} after {} use(s)",
                process.id, process.uses
            );
            process.shutdown().await;
        }
        if count > 0 {
            self.total_evictions.fetch_add(count, Ordering::Relaxed);
            self.metrics.record_pool_evictions(count);
        }
        count
    }

    fn record_usage(&self, state: &PoolState) {
        let active = state.processes.iter().filter(|p| p.active).count();
        self.metrics.record_pool_usage(active, state.processes.len());
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("config", &self.inner.config)
            .finish()
    }
}
