use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use tracing::{debug, error, warn};

use super::{spawn_worker, PoolInner};

/// Cancel tasks past their deadline and abandon workers whose cancelled task
/// overstayed the grace period.
pub(super) fn deadline_monitor(inner: Arc<PoolInner>) {
    let interval = inner.config.monitor_interval;
    let grace = inner.config.grace_timeout;
    let mut state = inner.lock_state();

    while !inner.is_shut_down() {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut stuck = Vec::new();

        for (task_id, running) in state.running.iter_mut() {
            match running.cancelled_at {
                Some(at) if at + grace <= now => stuck.push((*task_id, running.worker_id)),
                Some(_) => {}
                None => {
                    if running.deadline.is_some_and(|d| d <= now) {
                        running.cancelled_at = Some(now);
                        expired.push((*task_id, Arc::clone(&running.shared)));
                    }
                }
            }
        }

        for (task_id, worker_id) in stuck {
            if let Some(running) = state.running.remove(&task_id) {
                running.shared.mark_done();
                warn!(
                    task_id,
                    worker_id,
                    task = running.shared.task.name(),
                    "task ignored cancellation past grace period; abandoning worker"
                );
            }
            if let Some(slot) = state.workers.remove(&worker_id) {
                slot.abandoned.store(true, Ordering::Release);
            }
            if let Err(e) = spawn_worker(&inner, &mut state) {
                error!(error = %e, "failed to spawn replacement worker");
            }
            inner.idle.notify_all();
        }

        if !expired.is_empty() {
            drop(state);
            for (task_id, shared) in expired {
                warn!(
                    task_id,
                    task = shared.task.name(),
                    "task exceeded its maximum lifetime; cancelling"
                );
                shared.request_cancel();
            }
            state = inner.lock_state();
            continue;
        }

        state = inner
            .monitor_wake
            .wait_timeout(state, interval)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    debug!("deadline monitor stopped");
}

/// Replace worker threads that exited while the pool is still running.
pub(super) fn liveness_monitor(inner: Arc<PoolInner>) {
    let interval = inner.config.monitor_interval;
    let mut state = inner.lock_state();

    while !inner.is_shut_down() {
        let dead: Vec<u64> = state
            .workers
            .iter()
            .filter(|(_, slot)| slot.thread.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for worker_id in dead {
            error!(worker_id, "worker thread died unexpectedly; restarting");
            state.workers.remove(&worker_id);
            let orphaned: Vec<u64> = state
                .running
                .iter()
                .filter(|(_, r)| r.worker_id == worker_id)
                .map(|(id, _)| *id)
                .collect();
            for task_id in orphaned {
                if let Some(running) = state.running.remove(&task_id) {
                    running.shared.mark_done();
                }
            }
            if let Err(e) = spawn_worker(&inner, &mut state) {
                error!(error = %e, "failed to spawn replacement worker");
            }
            inner.idle.notify_all();
        }

        state = inner
            .monitor_wake
            .wait_timeout(state, interval)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    debug!("liveness monitor stopped");
}
