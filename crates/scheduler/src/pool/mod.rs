//! Bounded worker pool with lifetime reclamation.
//!
//! A fixed number of worker threads pull [`CancelableTask`]s from a FIFO
//! queue. Two monitor threads keep the pool healthy:
//! - `deadline`: cancels tasks that outlive `max_task_lifetime` and, when a
//!   cancelled task still has not returned after `grace_timeout`, abandons its
//!   worker and spawns a replacement so the pool keeps its configured size.
//! - `liveness`: replaces worker threads that died unexpectedly.
//!
//! Cancellation is always cooperative; a stuck worker thread is leaked, never
//! killed.

mod handle;
mod monitor;
#[cfg(test)]
mod tests;
mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use conduit_core::{ConduitError, Result};

pub use self::handle::{CancelToken, CancelableTask, TaskHandle};
use self::handle::TaskShared;

/// Worker pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix.
    pub name: String,
    pub workers: usize,
    /// `None` disables deadline reclamation; only explicit cancels apply.
    pub max_task_lifetime: Option<Duration>,
    /// How long a cancelled task may keep its worker before it is abandoned.
    pub grace_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "conduit".to_string(),
            workers: 4,
            max_task_lifetime: Some(Duration::from_secs(300)),
            grace_timeout: Duration::from_secs(5),
            monitor_interval: Duration::from_millis(250),
        }
    }
}

struct QueuedTask {
    id: u64,
    shared: Arc<TaskShared>,
    deadline: Option<Instant>,
}

struct RunningTask {
    worker_id: u64,
    shared: Arc<TaskShared>,
    deadline: Option<Instant>,
    cancelled_at: Option<Instant>,
}

struct WorkerSlot {
    thread: JoinHandle<()>,
    abandoned: Arc<AtomicBool>,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<QueuedTask>,
    running: HashMap<u64, RunningTask>,
    workers: HashMap<u64, WorkerSlot>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Workers wait here for queued tasks.
    work_ready: Condvar,
    /// Shutdown waits here for the running set to drain.
    idle: Condvar,
    /// Monitors sleep here between scans.
    monitor_wake: Condvar,
    shutdown: AtomicBool,
    next_task_id: AtomicU64,
    next_worker_id: AtomicU64,
    /// Idle workers that should exit as if their thread had died.
    #[cfg(test)]
    kill_requests: std::sync::atomic::AtomicUsize,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Bookkeeping for an explicit [`TaskHandle::cancel`].
    pub(crate) fn cancelled(&self, task_id: u64) {
        let mut state = self.lock_state();
        if let Some(pos) = state.queue.iter().position(|t| t.id == task_id) {
            if let Some(queued) = state.queue.remove(pos) {
                queued.shared.mark_done();
                debug!(task_id, task = queued.shared.task.name(), "cancelled queued task");
            }
        } else if let Some(running) = state.running.get_mut(&task_id) {
            running.cancelled_at.get_or_insert_with(Instant::now);
            self.monitor_wake.notify_all();
        }
    }
}

/// Spawn one worker thread and register its slot.
fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) -> Result<()> {
    let worker_id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let abandoned = Arc::new(AtomicBool::new(false));
    let thread = std::thread::Builder::new()
        .name(format!("{}-worker-{}", inner.config.name, worker_id))
        .spawn({
            let inner = Arc::clone(inner);
            let abandoned = Arc::clone(&abandoned);
            move || worker::worker_loop(inner, worker_id, abandoned)
        })?;
    state.workers.insert(worker_id, WorkerSlot { thread, abandoned });
    Ok(())
}

/// Fixed-size pool of worker threads running cancelable tasks.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start the workers and both monitors. Zero workers is an error.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(ConduitError::InvalidWorkerCount(config.workers));
        }

        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            monitor_wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
            next_worker_id: AtomicU64::new(1),
            #[cfg(test)]
            kill_requests: std::sync::atomic::AtomicUsize::new(0),
        });

        {
            let mut state = inner.lock_state();
            for _ in 0..inner.config.workers {
                spawn_worker(&inner, &mut state)?;
            }
        }

        let mut monitors = Vec::with_capacity(2);
        for (label, body) in [
            ("deadline", monitor::deadline_monitor as fn(Arc<PoolInner>)),
            ("liveness", monitor::liveness_monitor as fn(Arc<PoolInner>)),
        ] {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", inner.config.name, label))
                .spawn(move || body(inner))?;
            monitors.push(handle);
        }

        info!(
            "Worker pool '{}' started with {} workers (lifetime: {:?}, grace: {:?})",
            inner.config.name,
            inner.config.workers,
            inner.config.max_task_lifetime,
            inner.config.grace_timeout,
        );

        Ok(Self {
            inner,
            monitors: Mutex::new(monitors),
        })
    }

    /// Queue a task. Returns `None` once the pool is shut down.
    pub fn submit(&self, task: Arc<dyn CancelableTask>) -> Option<TaskHandle> {
        if self.inner.is_shut_down() {
            debug!(task = task.name(), "rejecting submission: pool is shut down");
            return None;
        }

        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(TaskShared::new(task));
        let deadline = self.inner.config.max_task_lifetime.map(|d| Instant::now() + d);

        let mut state = self.inner.lock_state();
        if self.inner.is_shut_down() {
            return None;
        }
        state.queue.push_back(QueuedTask {
            id,
            shared: Arc::clone(&shared),
            deadline,
        });
        self.inner.work_ready.notify_one();
        self.inner.monitor_wake.notify_all();
        debug!(task_id = id, task = shared.task.name(), "task submitted");

        Some(TaskHandle::new(id, shared, Arc::downgrade(&self.inner)))
    }

    /// Stop accepting work, drop the queue and wait up to `timeout` for
    /// running tasks. With `interrupt`, running tasks are cancelled first.
    /// Returns whether every in-flight task finished in time.
    pub fn shutdown(&self, interrupt: bool, timeout: Duration) -> bool {
        info!(
            "Worker pool '{}' shutting down (interrupt: {}, timeout: {:?})",
            self.inner.config.name, interrupt, timeout
        );
        self.inner.shutdown.store(true, Ordering::Release);

        let (drained, running): (Vec<_>, Vec<_>) = {
            let mut state = self.inner.lock_state();
            let drained = state.queue.drain(..).map(|q| q.shared).collect();
            let running = if interrupt {
                let now = Instant::now();
                state
                    .running
                    .values_mut()
                    .map(|r| {
                        r.cancelled_at.get_or_insert(now);
                        Arc::clone(&r.shared)
                    })
                    .collect()
            } else {
                Vec::new()
            };
            self.inner.work_ready.notify_all();
            self.inner.monitor_wake.notify_all();
            (drained, running)
        };

        for shared in drained {
            shared.request_cancel();
            shared.mark_done();
        }
        for shared in running {
            shared.request_cancel();
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock_state();
        while !state.running.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .inner
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let finished = state.running.is_empty();
        let still_running = state.running.len();
        drop(state);

        for monitor in self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            let _ = monitor.join();
        }

        if finished {
            info!("Worker pool '{}' stopped", self.inner.config.name);
        } else {
            warn!(
                "Worker pool '{}' shutdown timed out with {} task(s) still running",
                self.inner.config.name, still_running
            );
        }
        finished
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Configured number of workers.
    pub fn worker_count(&self) -> usize {
        self.inner.config.workers
    }

    /// Worker threads currently owned by the pool (abandoned ones excluded).
    pub fn live_workers(&self) -> usize {
        self.inner.lock_state().workers.len()
    }

    /// Tasks currently executing.
    pub fn busy_workers(&self) -> usize {
        self.inner.lock_state().running.len()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock_state().queue.len()
    }
}

#[cfg(test)]
impl WorkerPool {
    /// Make `n` idle workers exit without deregistering.
    pub(crate) fn kill_idle_workers(&self, n: usize) {
        self.inner.kill_requests.fetch_add(n, Ordering::AcqRel);
        let _state = self.inner.lock_state();
        self.inner.work_ready.notify_all();
    }

    /// Worker threads spawned over the pool's lifetime.
    pub(crate) fn spawned_workers(&self) -> u64 {
        self.inner.next_worker_id.load(Ordering::Acquire) - 1
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            let _state = self.inner.lock_state();
            self.inner.work_ready.notify_all();
            self.inner.monitor_wake.notify_all();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.config.name)
            .field("workers", &self.inner.config.workers)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
