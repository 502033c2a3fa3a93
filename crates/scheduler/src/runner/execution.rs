use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use super::TraversalScheduler;

impl TraversalScheduler {
    /// Run the scheduling loop. Blocks until [`stop`](Self::stop) is called.
    pub fn run(&self) {
        let interval = self.ctx.config.pass_interval();
        info!(
            workers = self.ctx.pool.worker_count(),
            connectors = self.manager.connector_names().len(),
            pass_interval_ms = interval.as_millis() as u64,
            "Scheduler starting"
        );

        while !self.stop.is_cancelled() {
            self.run_pass();
            if self.stop.wait_timeout(interval) {
                break;
            }
        }

        info!("Scheduler stopped");
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self: Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("traversal-scheduler".to_string())
            .spawn(move || self.run())
    }

    /// Stop the loop, interrupt in-flight batches and wait up to the
    /// configured shutdown timeout for the pool to drain. Returns whether
    /// every batch finished in time.
    pub fn shutdown(&self) -> bool {
        self.stop();
        let timeout: Duration = self.ctx.config.shutdown_timeout();
        let drained = self.ctx.pool.shutdown(true, timeout);
        if drained {
            info!("All in-flight batches finished");
        } else {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timed out with batches still running"
            );
        }
        drained
    }
}
