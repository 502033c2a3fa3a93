use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::context::SchedulerContext;
use crate::coordinator::BatchResultRecorder;
use crate::manager::ConnectorManager;
use crate::metrics::{MetricsRecorder, SchedulerMetrics};
use crate::pool::CancelToken;

/// Drives every connector's coordinator on a fixed cadence.
pub struct TraversalScheduler {
    pub(super) manager: Arc<ConnectorManager>,
    pub(super) ctx: Arc<SchedulerContext>,
    /// Result sink handed to every batch; folds results into `metrics`.
    pub(super) sink: Arc<dyn BatchResultRecorder>,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    /// Stop signal for the loop.
    pub(super) stop: CancelToken,
}

impl TraversalScheduler {
    /// Create a scheduler over `manager`. Every non-superseded batch result
    /// is forwarded to `sink`.
    pub fn new(manager: Arc<ConnectorManager>, sink: Arc<dyn BatchResultRecorder>) -> Self {
        let ctx = Arc::clone(manager.context());
        let metrics = Arc::new(RwLock::new(SchedulerMetrics::default()));
        let sink = Arc::new(MetricsRecorder {
            metrics: Arc::clone(&metrics),
            inner: sink,
        });
        Self {
            manager,
            ctx,
            sink,
            metrics,
            stop: CancelToken::new(),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectorManager> {
        &self.manager
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Signal the loop to stop after the current pass.
    pub fn stop(&self) {
        info!("Scheduler stop requested");
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancelToken {
        self.stop.clone()
    }
}

impl std::fmt::Debug for TraversalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraversalScheduler")
            .field("manager", &self.manager)
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}
