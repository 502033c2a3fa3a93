use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::{PoolInner, QueuedTask, RunningTask};

/// Body of one worker thread. Exits on shutdown once the queue is empty, or
/// after finishing a task it was abandoned on.
pub(super) fn worker_loop(inner: Arc<PoolInner>, worker_id: u64, abandoned: Arc<AtomicBool>) {
    debug!(worker_id, "worker started");
    loop {
        let QueuedTask { id, shared, deadline } = {
            let mut state = inner.lock_state();
            loop {
                if killed(&inner) {
                    return;
                }
                if let Some(task) = state.queue.pop_front() {
                    state.running.insert(
                        task.id,
                        RunningTask {
                            worker_id,
                            shared: Arc::clone(&task.shared),
                            deadline: task.deadline,
                            cancelled_at: None,
                        },
                    );
                    break task;
                }
                if inner.is_shut_down() {
                    debug!(worker_id, "worker exiting on shutdown");
                    return;
                }
                state = inner
                    .work_ready
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };

        if deadline.is_some_and(|d| d <= Instant::now()) {
            debug!(task_id = id, "task started past its deadline");
        }

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| shared.task.run(&shared.token)));
        if outcome.is_err() {
            error!(worker_id, task_id = id, task = shared.task.name(), "task panicked");
        }
        shared.mark_done();

        let mut state = inner.lock_state();
        state.running.remove(&id);
        inner.idle.notify_all();
        drop(state);

        if abandoned.load(Ordering::Acquire) {
            warn!(
                worker_id,
                task_id = id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "abandoned worker finished late; retiring thread"
            );
            return;
        }
    }
}

#[cfg(test)]
fn killed(inner: &PoolInner) -> bool {
    inner
        .kill_requests
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(not(test))]
fn killed(_inner: &PoolInner) -> bool {
    false
}
