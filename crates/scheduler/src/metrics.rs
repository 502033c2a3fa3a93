use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use conduit_core::BatchResult;

use crate::coordinator::BatchResultRecorder;

/// Scheduling loop telemetry for external observers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Clock time of the most recent pass.
    pub now: Option<DateTime<Utc>>,
    /// Scheduling passes run so far.
    pub passes: u64,
    /// Connectors known at the last pass.
    pub known_connectors: usize,
    /// Batches in flight at the end of the last pass.
    pub running_batches: usize,
    /// Batches submitted by the last pass.
    pub started_last_pass: usize,
    /// Completed batches by connector.
    pub batches_completed: HashMap<String, u64>,
    /// Items traversed by connector.
    pub items_traversed: HashMap<String, u64>,
    /// Average batch duration by connector.
    pub avg_batch_duration: HashMap<String, Duration>,
    /// Most recent result by connector.
    pub last_result: HashMap<String, BatchResult>,
    /// Documents per minute over the current load period, by connector.
    pub throughput: HashMap<String, f64>,
    /// End of the active backoff window, by connector.
    pub delayed_until: HashMap<String, DateTime<Utc>>,
    /// Hours until the schedule's next window opens (0 while inside one).
    /// Connectors whose schedule can never run are absent.
    pub hours_until_window: HashMap<String, u32>,
    pub live_workers: usize,
    pub busy_workers: usize,
    /// Busy workers over configured workers (0.0 - 1.0).
    pub worker_utilization: f64,
}

impl SchedulerMetrics {
    /// Record a completed batch.
    pub fn record_batch(&mut self, connector: &str, result: &BatchResult) {
        *self.batches_completed.entry(connector.to_string()).or_default() += 1;
        *self.items_traversed.entry(connector.to_string()).or_default() += result.count as u64;
        self.last_result.insert(connector.to_string(), result.clone());

        let count = self.batches_completed[connector];
        let prev_avg = self
            .avg_batch_duration
            .get(connector)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            result.elapsed
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = result.elapsed.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_batch_duration.insert(connector.to_string(), new_avg);
    }

    /// Forget a removed connector.
    pub fn forget(&mut self, connector: &str) {
        self.batches_completed.remove(connector);
        self.items_traversed.remove(connector);
        self.avg_batch_duration.remove(connector);
        self.last_result.remove(connector);
        self.throughput.remove(connector);
        self.delayed_until.remove(connector);
        self.hours_until_window.remove(connector);
    }
}

/// Sink wrapper folding every result into [`SchedulerMetrics`] before
/// forwarding it.
pub(crate) struct MetricsRecorder {
    pub(crate) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(crate) inner: Arc<dyn BatchResultRecorder>,
}

impl BatchResultRecorder for MetricsRecorder {
    fn record_result(&self, connector: &str, result: &BatchResult) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_batch(connector, result);
        self.inner.record_result(connector, result);
    }
}
