use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, info_span};
use uuid::Uuid;

use conduit_core::BatchResult;

use crate::pool::{CancelToken, CancelableTask};
use crate::traversal::Traverser;

use super::ConnectorCoordinator;

/// Receives the outcome of every batch that was not superseded.
pub trait BatchResultRecorder: Send + Sync {
    fn record_result(&self, connector: &str, result: &BatchResult);
}

/// One traversal batch submitted to the worker pool.
pub(crate) struct CancelableBatch {
    pub(super) batch_id: Uuid,
    pub(super) connector: String,
    pub(super) generation: u64,
    pub(super) max_items: usize,
    pub(super) traverser: Arc<dyn Traverser>,
    pub(super) coordinator: Weak<ConnectorCoordinator>,
    pub(super) sink: Arc<dyn BatchResultRecorder>,
}

impl CancelableTask for CancelableBatch {
    fn run(&self, token: &CancelToken) {
        let span = info_span!("batch", connector = %self.connector, batch_id = %self.batch_id);
        let _enter = span.enter();

        let started = Instant::now();
        let code = self.traverser.run_batch(self.max_items, token);
        let result = BatchResult::from_legacy_code(code).with_elapsed(started.elapsed());
        debug!(
            code,
            count = result.count,
            policy = ?result.policy,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "batch returned"
        );

        match self.coordinator.upgrade() {
            Some(coordinator) => coordinator.batch_completed(
                self.generation,
                result,
                token.is_cancelled(),
                self.sink.as_ref(),
            ),
            None => debug!("coordinator dropped; result discarded"),
        }
    }

    fn cancel(&self) {
        self.traverser.cancel_batch();
    }

    fn name(&self) -> &str {
        &self.connector
    }
}
