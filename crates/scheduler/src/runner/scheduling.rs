use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError};

use rayon::prelude::*;
use tracing::{debug, error, warn};

use conduit_core::Result;

use crate::coordinator::{ConnectorCoordinator, CoordinatorPhase};

use super::TraversalScheduler;

impl TraversalScheduler {
    /// Run one scheduling pass and return the number of batches started.
    ///
    /// Coordinators are evaluated in parallel. A failure while evaluating
    /// one connector is logged and does not affect the others.
    pub fn run_pass(&self) -> usize {
        let coordinators = self.manager.coordinators();
        let started: usize = coordinators
            .par_iter()
            .map(|coordinator| {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.schedule_one(coordinator)));
                match outcome {
                    Ok(Ok(started)) => usize::from(started),
                    Ok(Err(e)) => {
                        warn!(connector = coordinator.name(), error = %e, "failed to schedule connector");
                        0
                    }
                    Err(_) => {
                        error!(connector = coordinator.name(), "panic while scheduling connector");
                        0
                    }
                }
            })
            .sum();

        self.update_metrics(&coordinators, started);
        if started > 0 {
            debug!(started, known = coordinators.len(), "scheduling pass");
        }
        started
    }

    /// Decide whether `coordinator` should run now and, if so, submit a
    /// batch sized by the host load throttle.
    fn schedule_one(&self, coordinator: &ConnectorCoordinator) -> Result<bool> {
        if coordinator.phase() != CoordinatorPhase::Idle {
            return Ok(false);
        }
        let Some(schedule) = coordinator.schedule() else {
            return Ok(false);
        };
        if !schedule.should_run(self.ctx.clock.local_hour()) {
            return Ok(false);
        }
        let name = coordinator.name();
        if self.ctx.throttle.should_delay(name) {
            return Ok(false);
        }
        let hint = self.ctx.throttle.determine_batch_hint(name, schedule.load());
        if hint == 0 {
            return Ok(false);
        }
        coordinator.start_batch(Arc::clone(&self.sink), hint)
    }

    fn update_metrics(&self, coordinators: &[Arc<ConnectorCoordinator>], started: usize) {
        let running = coordinators.iter().filter(|c| c.is_running()).count();
        let known: BTreeSet<&str> = coordinators.iter().map(|c| c.name()).collect();
        let pool = &self.ctx.pool;
        let workers = pool.worker_count().max(1);

        let mut m = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        m.now = Some(self.ctx.clock.now());
        m.passes += 1;
        m.known_connectors = coordinators.len();
        m.running_batches = running;
        m.started_last_pass = started;
        m.live_workers = pool.live_workers();
        m.busy_workers = pool.busy_workers();
        m.worker_utilization = m.busy_workers as f64 / workers as f64;

        let hour = self.ctx.clock.local_hour();
        m.throughput.clear();
        m.delayed_until.clear();
        m.hours_until_window.clear();
        for coordinator in coordinators {
            let name = coordinator.name();
            if let Some(rate) = self.ctx.throttle.throughput(name) {
                m.throughput.insert(name.to_string(), rate);
            }
            if let Some(until) = self.ctx.throttle.delayed_until(name) {
                m.delayed_until.insert(name.to_string(), until);
            }
            if let Some(hours) = coordinator
                .schedule()
                .and_then(|s| s.hours_until_next_window(hour))
            {
                m.hours_until_window.insert(name.to_string(), hours);
            }
        }

        let gone: Vec<String> = m
            .batches_completed
            .keys()
            .filter(|name| !known.contains(name.as_str()))
            .cloned()
            .collect();
        for name in gone {
            m.forget(&name);
        }
    }
}
