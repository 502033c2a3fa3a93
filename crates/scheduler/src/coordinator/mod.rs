//! Per-connector coordinator.
//!
//! Each connector owns one [`ConnectorCoordinator`] holding its live
//! configuration and schedule, the cached traverser and the handle of the
//! single batch allowed in flight. Every batch carries the generation it was
//! started under; interrupting a connector bumps the generation so that a
//! late completion from the interrupted batch is recognised as stale.

mod batch;

pub use self::batch::BatchResultRecorder;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use conduit_core::{BatchResult, ConduitError, ConnectorConfig, DelayPolicy, Result, Schedule};

use self::batch::CancelableBatch;
use crate::context::SchedulerContext;
use crate::pool::TaskHandle;
use crate::throttle::FinishAction;
use crate::traversal::{CheckpointCell, QueryTraverser, Traverser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Idle,
    Running,
    Removed,
}

#[derive(Default)]
struct CoordinatorState {
    config: Option<Arc<ConnectorConfig>>,
    schedule: Option<Arc<Schedule>>,
    traverser: Option<Arc<dyn Traverser>>,
    task_handle: Option<TaskHandle>,
    generation: u64,
    removed: bool,
}

impl CoordinatorState {
    fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|h| !h.is_done())
    }

    /// Clear a handle whose batch ended without reporting back: the pool
    /// abandoned its worker or dropped it from the queue. The cached
    /// traverser may still be held by the abandoned thread, so it is
    /// dropped too. Returns whether anything was reclaimed.
    fn reap_reclaimed(&mut self) -> bool {
        if !self.task_handle.as_ref().is_some_and(TaskHandle::is_done) {
            return false;
        }
        self.generation += 1;
        self.task_handle = None;
        self.traverser = None;
        true
    }

    /// Invalidate the in-flight batch. The returned handle must be cancelled
    /// after the state lock is released.
    fn interrupt(&mut self) -> Option<TaskHandle> {
        self.generation += 1;
        self.task_handle.take()
    }
}

pub struct ConnectorCoordinator {
    name: String,
    ctx: Arc<SchedulerContext>,
    checkpoint: Arc<CheckpointCell>,
    state: Mutex<CoordinatorState>,
    me: Weak<ConnectorCoordinator>,
}

impl ConnectorCoordinator {
    pub fn new(name: impl Into<String>, ctx: Arc<SchedulerContext>) -> Arc<Self> {
        let name = name.into();
        let checkpoint = Arc::new(CheckpointCell::new(name.clone(), Arc::clone(&ctx.store)));
        Arc::new_cyclic(|me| Self {
            name,
            ctx,
            checkpoint,
            state: Mutex::new(CoordinatorState::default()),
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> Result<MutexGuard<'_, CoordinatorState>> {
        let state = self.lock();
        if state.removed {
            return Err(ConduitError::ConnectorNotFound(self.name.clone()));
        }
        Ok(state)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> CoordinatorPhase {
        let mut state = self.lock();
        self.reap(&mut state);
        if state.removed {
            CoordinatorPhase::Removed
        } else if state.is_running() {
            CoordinatorPhase::Running
        } else {
            CoordinatorPhase::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase() == CoordinatorPhase::Running
    }

    pub fn configuration(&self) -> Option<Arc<ConnectorConfig>> {
        self.lock().config.clone()
    }

    pub fn schedule(&self) -> Option<Arc<Schedule>> {
        self.lock().schedule.clone()
    }

    /// Replace the configuration. An in-flight batch is cancelled and the
    /// cached traverser dropped. Returns `false` if the value is unchanged.
    pub fn set_configuration(&self, config: ConnectorConfig) -> Result<bool> {
        let mut state = self.live()?;
        if state.config.as_deref() == Some(&config) {
            return Ok(false);
        }
        state.config = Some(Arc::new(config));
        state.traverser = None;
        let handle = state.interrupt();
        drop(state);

        if let Some(handle) = handle {
            info!(connector = %self.name, "configuration changed; cancelling in-flight batch");
            handle.cancel();
        }
        Ok(true)
    }

    /// Replace the schedule, cancelling an in-flight batch. Returns `false`
    /// if the value is unchanged.
    pub fn set_schedule(&self, schedule: Schedule) -> Result<bool> {
        let mut state = self.live()?;
        if state.schedule.as_deref() == Some(&schedule) {
            return Ok(false);
        }
        debug!(connector = %self.name, schedule = %schedule, "schedule updated");
        state.schedule = Some(Arc::new(schedule));
        let handle = state.interrupt();
        drop(state);

        if let Some(handle) = handle {
            info!(connector = %self.name, "schedule changed; cancelling in-flight batch");
            handle.cancel();
        }
        Ok(true)
    }

    /// Submit one batch of at most `max_items` if the connector is idle, its
    /// schedule allows running at this hour and it is not backing off.
    /// Returns whether a batch was submitted.
    pub fn start_batch(&self, sink: Arc<dyn BatchResultRecorder>, max_items: usize) -> Result<bool> {
        let mut state = self.live()?;
        self.reap(&mut state);
        if state.is_running() {
            return Ok(false);
        }
        let Some(schedule) = state.schedule.clone() else {
            return Ok(false);
        };
        if !schedule.should_run(self.ctx.clock.local_hour()) {
            return Ok(false);
        }
        if self.ctx.throttle.should_delay(&self.name) || max_items == 0 {
            return Ok(false);
        }

        let traverser = match state.traverser.clone() {
            Some(traverser) => traverser,
            None => match self.build_traverser(&state) {
                Ok(traverser) => {
                    state.traverser = Some(Arc::clone(&traverser));
                    traverser
                }
                Err(e) => {
                    warn!(connector = %self.name, error = %e, "cannot instantiate traverser; backing off");
                    self.ctx
                        .throttle
                        .connector_finished_traversal(&self.name, Some(self.ctx.config.error_backoff()));
                    return Ok(false);
                }
            },
        };

        state.generation += 1;
        let batch = CancelableBatch {
            batch_id: Uuid::new_v4(),
            connector: self.name.clone(),
            generation: state.generation,
            max_items,
            traverser,
            coordinator: self.me.clone(),
            sink,
        };
        let batch_id = batch.batch_id;

        match self.ctx.pool.submit(Arc::new(batch)) {
            Some(handle) => {
                debug!(connector = %self.name, %batch_id, max_items, "batch submitted");
                state.task_handle = Some(handle);
                Ok(true)
            }
            None => Err(ConduitError::PoolShutDown),
        }
    }

    fn reap(&self, state: &mut CoordinatorState) {
        if state.reap_reclaimed() {
            let err = ConduitError::Timeout(self.name.clone());
            warn!(error = %err, "batch reclaimed by the pool; discarding cached traverser");
            self.ctx
                .throttle
                .connector_finished_traversal(&self.name, Some(self.ctx.config.error_backoff()));
        }
    }

    fn build_traverser(&self, state: &CoordinatorState) -> Result<Arc<dyn Traverser>> {
        let config = state
            .config
            .as_ref()
            .ok_or_else(|| ConduitError::ConnectorNotFound(self.name.clone()))?;
        let manager = self.ctx.connector_types.instantiate(&self.name, config)?;
        Ok(Arc::new(QueryTraverser::new(
            self.name.clone(),
            manager,
            Arc::clone(&self.checkpoint),
        )))
    }

    /// Completion callback, invoked on the worker thread that ran the batch.
    pub(crate) fn batch_completed(
        &self,
        generation: u64,
        result: BatchResult,
        cancelled: bool,
        sink: &dyn BatchResultRecorder,
    ) {
        let mut state = self.lock();
        if state.removed {
            debug!(connector = %self.name, "connector removed; batch result dropped");
            return;
        }
        self.ctx
            .throttle
            .update_num_docs_traversed(&self.name, result.count);
        if generation != state.generation {
            debug!(connector = %self.name, count = result.count, "superseded batch finished");
            return;
        }
        state.task_handle = None;

        if cancelled {
            let err = ConduitError::Timeout(self.name.clone());
            warn!(error = %err, "batch cancelled before completing; backing off");
            self.ctx
                .throttle
                .connector_finished_traversal(&self.name, Some(self.ctx.config.error_backoff()));
            return;
        }

        let delay = match result.policy {
            DelayPolicy::Immediate => Some(Duration::ZERO),
            DelayPolicy::Poll => match &state.schedule {
                Some(schedule) => schedule.retry_delay().as_duration(),
                None => Some(Duration::ZERO),
            },
            DelayPolicy::Error => Some(self.ctx.config.error_backoff()),
        };

        if self.ctx.throttle.connector_finished_traversal(&self.name, delay) == FinishAction::DisableSchedule {
            if let Some(schedule) = state.schedule.as_deref() {
                let disabled = schedule.with_disabled(true);
                if let Err(e) = self.ctx.store.store_schedule(&self.name, &disabled) {
                    warn!(connector = %self.name, error = %e, "failed to persist disabled schedule");
                }
                info!(connector = %self.name, "polling disabled; schedule disabled");
                state.schedule = Some(Arc::new(disabled));
            }
        }
        drop(state);

        sink.record_result(&self.name, &result);
    }

    /// Cancel any in-flight batch and clear the checkpoint so the next batch
    /// starts a fresh traversal.
    pub fn restart_connector_traversal(&self) -> Result<()> {
        let mut state = self.live()?;
        state.traverser = None;
        let handle = state.interrupt();
        drop(state);

        if let Some(handle) = handle {
            handle.cancel();
        }
        self.checkpoint.write(None)?;
        info!(connector = %self.name, "traversal restarted");
        Ok(())
    }

    /// Cancel in-flight work and release everything held for this connector.
    /// Later calls fail with `ConnectorNotFound`.
    pub fn remove_connector(&self) {
        let mut state = self.lock();
        if state.removed {
            return;
        }
        state.removed = true;
        state.config = None;
        state.schedule = None;
        state.traverser = None;
        let handle = state.interrupt();
        drop(state);

        if let Some(handle) = handle {
            handle.cancel();
        }
        self.ctx.throttle.remove_connector(&self.name);
        info!(connector = %self.name, "connector removed");
    }

    /// A checkpoint written by another process. Our own writes are ignored;
    /// a foreign one cancels the in-flight batch so the next batch resumes
    /// from the stored position.
    pub fn checkpoint_changed(&self, checkpoint: Option<&str>) -> Result<()> {
        let mut state = self.live()?;
        if self.checkpoint.matches_local(checkpoint) {
            return Ok(());
        }
        state.traverser = None;
        let handle = state.interrupt();
        drop(state);

        if let Some(handle) = handle {
            handle.cancel();
        }
        info!(connector = %self.name, checkpoint = ?checkpoint, "checkpoint changed externally");
        Ok(())
    }
}

impl std::fmt::Debug for ConnectorCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorCoordinator")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .finish()
    }
}
