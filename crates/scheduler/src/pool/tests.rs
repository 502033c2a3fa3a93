use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conduit_core::ConduitError;

use super::{CancelToken, CancelableTask, PoolConfig, WorkerPool};

fn config(workers: usize) -> PoolConfig {
    PoolConfig {
        name: "test".to_string(),
        workers,
        max_task_lifetime: None,
        grace_timeout: Duration::from_millis(100),
        monitor_interval: Duration::from_millis(10),
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Records its label into a shared log.
struct Recording {
    label: usize,
    log: Arc<Mutex<Vec<usize>>>,
}

impl CancelableTask for Recording {
    fn run(&self, _token: &CancelToken) {
        self.log.lock().unwrap().push(self.label);
    }
}

/// Waits on the token, counting cancel hook invocations.
struct Cooperative {
    cancels: AtomicUsize,
    observed_cancel: AtomicBool,
}

impl Cooperative {
    fn new() -> Self {
        Self {
            cancels: AtomicUsize::new(0),
            observed_cancel: AtomicBool::new(false),
        }
    }
}

impl CancelableTask for Cooperative {
    fn run(&self, token: &CancelToken) {
        if token.wait_timeout(Duration::from_secs(10)) {
            self.observed_cancel.store(true, Ordering::SeqCst);
        }
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Ignores the token and blocks until the test releases it.
struct Stubborn {
    release: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
}

impl Stubborn {
    fn new() -> (Arc<Self>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let task = Arc::new(Self {
            release: Arc::clone(&release),
            started: Arc::clone(&started),
        });
        (task, release, started)
    }
}

impl CancelableTask for Stubborn {
    fn run(&self, _token: &CancelToken) {
        self.started.store(true, Ordering::SeqCst);
        while !self.release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

struct Panicking;

impl CancelableTask for Panicking {
    fn run(&self, _token: &CancelToken) {
        panic!("boom");
    }
}

#[test]
fn zero_workers_is_rejected() {
    let err = WorkerPool::new(config(0)).unwrap_err();
    assert!(matches!(err, ConduitError::InvalidWorkerCount(0)));
}

#[test]
fn single_worker_runs_fifo() {
    let pool = WorkerPool::new(config(1)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..5)
        .map(|label| {
            pool.submit(Arc::new(Recording {
                label,
                log: Arc::clone(&log),
            }))
            .unwrap()
        })
        .collect();

    assert!(wait_until(Duration::from_secs(2), || handles.iter().all(|h| h.is_done())));
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(pool.shutdown(false, Duration::from_secs(1)));
}

#[test]
fn cooperative_cancel_is_idempotent() {
    let pool = WorkerPool::new(config(1)).unwrap();
    let task = Arc::new(Cooperative::new());
    let handle = pool.submit(task.clone()).unwrap();

    assert!(wait_until(Duration::from_secs(1), || pool.busy_workers() == 1));
    handle.cancel();
    handle.cancel();

    assert!(handle.is_cancelled());
    assert!(wait_until(Duration::from_secs(1), || handle.is_done()));
    assert!(wait_until(Duration::from_secs(1), || pool.busy_workers() == 0));
    assert!(task.observed_cancel.load(Ordering::SeqCst));
    assert_eq!(task.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(pool.live_workers(), 1);
}

#[test]
fn cancelling_queued_task_removes_it() {
    let pool = WorkerPool::new(config(1)).unwrap();
    let (blocker, release, started) = Stubborn::new();
    pool.submit(blocker).unwrap();
    assert!(wait_until(Duration::from_secs(1), || started.load(Ordering::SeqCst)));

    let log = Arc::new(Mutex::new(Vec::new()));
    let queued = pool
        .submit(Arc::new(Recording {
            label: 7,
            log: Arc::clone(&log),
        }))
        .unwrap();
    assert_eq!(pool.queued(), 1);
    queued.cancel();
    assert_eq!(pool.queued(), 0);
    assert!(queued.is_done());

    release.store(true, Ordering::SeqCst);
    assert!(pool.shutdown(false, Duration::from_secs(1)));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn cancelled_stubborn_task_frees_its_slot_within_grace() {
    let pool = WorkerPool::new(config(1)).unwrap();
    let (task, release, started) = Stubborn::new();
    let handle = pool.submit(task).unwrap();
    assert!(wait_until(Duration::from_secs(1), || started.load(Ordering::SeqCst)));

    let cancelled_at = Instant::now();
    handle.cancel();

    // The replacement worker picks up new work while the old one is stuck.
    let log = Arc::new(Mutex::new(Vec::new()));
    let next = pool
        .submit(Arc::new(Recording {
            label: 1,
            log: Arc::clone(&log),
        }))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || next.is_done()));
    assert!(cancelled_at.elapsed() >= Duration::from_millis(100));
    assert_eq!(*log.lock().unwrap(), vec![1]);
    assert_eq!(pool.live_workers(), 1);

    release.store(true, Ordering::SeqCst);
}

#[test]
fn task_past_lifetime_is_reclaimed() {
    let mut cfg = config(1);
    cfg.max_task_lifetime = Some(Duration::from_millis(50));
    cfg.grace_timeout = Duration::from_millis(50);
    let pool = WorkerPool::new(cfg).unwrap();

    let (task, release, _) = Stubborn::new();
    let submitted = Instant::now();
    let handle = pool.submit(task).unwrap();

    assert!(wait_until(Duration::from_secs(2), || handle.is_cancelled()));
    assert!(!handle.is_done());
    assert!(wait_until(Duration::from_secs(2), || handle.is_done()));
    assert_eq!(pool.busy_workers(), 0);
    assert!(submitted.elapsed() >= Duration::from_millis(100));
    assert_eq!(pool.live_workers(), pool.worker_count());

    let log = Arc::new(Mutex::new(Vec::new()));
    let next = pool
        .submit(Arc::new(Recording {
            label: 2,
            log: Arc::clone(&log),
        }))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || next.is_done()));
    assert_eq!(*log.lock().unwrap(), vec![2]);

    release.store(true, Ordering::SeqCst);
}

#[test]
fn no_lifetime_means_no_reclamation() {
    let pool = WorkerPool::new(config(1)).unwrap();
    let task = Arc::new(Cooperative::new());
    let handle = pool.submit(task.clone()).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert!(!handle.is_done());
    assert_eq!(task.cancels.load(Ordering::SeqCst), 0);

    handle.cancel();
    assert!(pool.shutdown(false, Duration::from_secs(1)));
}

#[test]
fn panicking_task_does_not_kill_the_worker() {
    let pool = WorkerPool::new(config(1)).unwrap();
    let failed = pool.submit(Arc::new(Panicking)).unwrap();
    assert!(wait_until(Duration::from_secs(1), || failed.is_done()));

    let log = Arc::new(Mutex::new(Vec::new()));
    let next = pool
        .submit(Arc::new(Recording {
            label: 3,
            log: Arc::clone(&log),
        }))
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || next.is_done()));
    assert_eq!(*log.lock().unwrap(), vec![3]);
    assert_eq!(pool.live_workers(), 1);
}

#[test]
fn dead_worker_is_replaced() {
    let pool = WorkerPool::new(config(2)).unwrap();
    assert_eq!(pool.spawned_workers(), 2);

    pool.kill_idle_workers(1);
    assert!(wait_until(Duration::from_secs(1), || pool.spawned_workers() == 3));
    assert!(wait_until(Duration::from_secs(1), || pool.live_workers() == 2));

    let log = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..4)
        .map(|label| {
            pool.submit(Arc::new(Recording {
                label,
                log: Arc::clone(&log),
            }))
            .unwrap()
        })
        .collect();
    assert!(wait_until(Duration::from_secs(1), || handles.iter().all(|h| h.is_done())));
    assert_eq!(log.lock().unwrap().len(), 4);
}

#[test]
fn submit_after_shutdown_returns_none() {
    let pool = WorkerPool::new(config(2)).unwrap();
    assert!(pool.shutdown(false, Duration::from_millis(200)));
    assert!(pool.is_shut_down());
    assert!(pool.submit(Arc::new(Panicking)).is_none());
}

#[test]
fn shutdown_interrupts_cooperative_tasks() {
    let pool = WorkerPool::new(config(2)).unwrap();
    let first = Arc::new(Cooperative::new());
    let second = Arc::new(Cooperative::new());
    pool.submit(first.clone()).unwrap();
    pool.submit(second.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || pool.busy_workers() == 2));

    assert!(pool.shutdown(true, Duration::from_secs(2)));
    assert!(first.observed_cancel.load(Ordering::SeqCst));
    assert!(second.observed_cancel.load(Ordering::SeqCst));
}

#[test]
fn shutdown_reports_stragglers() {
    let pool = WorkerPool::new(config(1)).unwrap();
    let (task, release, started) = Stubborn::new();
    pool.submit(task).unwrap();
    assert!(wait_until(Duration::from_secs(1), || started.load(Ordering::SeqCst)));

    let began = Instant::now();
    assert!(!pool.shutdown(false, Duration::from_millis(100)));
    assert!(began.elapsed() >= Duration::from_millis(100));

    release.store(true, Ordering::SeqCst);
}
