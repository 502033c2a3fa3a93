use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

use super::PoolInner;

/// Cooperative cancellation signal shared between a unit of work and
/// whoever may want to stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`, waking early on cancellation.
    /// Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .inner
            .cond
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// A unit of work the [`WorkerPool`](super::WorkerPool) can run and stop.
pub trait CancelableTask: Send + Sync {
    /// Execute the work. Long-running implementations must poll `token`.
    fn run(&self, token: &CancelToken);

    /// Called once when the task is cancelled or exceeds its lifetime, in
    /// addition to the token being tripped. Use it to abort blocking calls
    /// that cannot observe the token.
    fn cancel(&self) {}

    /// Label for logs.
    fn name(&self) -> &str {
        "task"
    }
}

pub(crate) struct TaskShared {
    pub(crate) task: Arc<dyn CancelableTask>,
    pub(crate) token: CancelToken,
    done: AtomicBool,
    cancel_requested: AtomicBool,
}

impl TaskShared {
    pub(crate) fn new(task: Arc<dyn CancelableTask>) -> Self {
        Self {
            task,
            token: CancelToken::new(),
            done: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Trip the token and fire the task's cancel hook. Returns `true` only
    /// for the first request.
    pub(crate) fn request_cancel(&self) -> bool {
        if self.cancel_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        self.task.cancel();
        true
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }
}

/// Handle to a submitted task.
///
/// A handle reports done once its worker is free again: the task returned,
/// was dropped from the queue, or its worker was abandoned after the grace
/// period. Cancellation alone does not make a handle done.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    shared: Arc<TaskShared>,
    pool: Weak<PoolInner>,
}

impl TaskHandle {
    pub(crate) fn new(id: u64, shared: Arc<TaskShared>, pool: Weak<PoolInner>) -> Self {
        Self { id, shared, pool }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancel_requested()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.shared.request_cancel() {
            if let Some(pool) = self.pool.upgrade() {
                pool.cancelled(self.id);
            }
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("task", &self.shared.task.name())
            .field("done", &self.is_done())
            .finish()
    }
}
