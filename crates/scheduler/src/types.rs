use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::PoolConfig;

/// Scheduler configuration, typically parsed from the `[scheduler]` table of
/// the connector manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Maximum batch lifetime in seconds. 0 = never reclaimed.
    #[serde(default = "default_max_task_lifetime")]
    pub max_task_lifetime_secs: u64,
    /// Extra time a cancelled batch may keep its worker.
    #[serde(default = "default_grace_timeout")]
    pub grace_timeout_ms: u64,
    /// Worker pool monitor scan interval.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// Pause between scheduling passes.
    #[serde(default = "default_pass_interval")]
    pub pass_interval_ms: u64,
    /// Period of the background change detector.
    #[serde(default = "default_change_detection_interval")]
    pub change_detection_interval_secs: u64,
    /// Backoff after a batch reports an error.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
    /// Window over which a connector's per-minute load is budgeted.
    #[serde(default = "default_load_period")]
    pub load_period_ms: u64,
    /// Upper bound for a single batch hint.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long shutdown waits for in-flight batches.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_worker_threads() -> usize { 0 }
fn default_max_task_lifetime() -> u64 { 300 }
fn default_grace_timeout() -> u64 { 5_000 }
fn default_monitor_interval() -> u64 { 250 }
fn default_pass_interval() -> u64 { 1_000 }
fn default_change_detection_interval() -> u64 { 30 }
fn default_error_backoff() -> u64 { 300_000 }
fn default_load_period() -> u64 { 60_000 }
fn default_max_batch_size() -> usize { 500 }
fn default_shutdown_timeout() -> u64 { 10_000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_task_lifetime_secs: default_max_task_lifetime(),
            grace_timeout_ms: default_grace_timeout(),
            monitor_interval_ms: default_monitor_interval(),
            pass_interval_ms: default_pass_interval(),
            change_detection_interval_secs: default_change_detection_interval(),
            error_backoff_ms: default_error_backoff(),
            load_period_ms: default_load_period(),
            max_batch_size: default_max_batch_size(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            name: "traversal".to_string(),
            workers: self.resolved_worker_threads(),
            max_task_lifetime: (self.max_task_lifetime_secs > 0)
                .then(|| Duration::from_secs(self.max_task_lifetime_secs)),
            grace_timeout: Duration::from_millis(self.grace_timeout_ms),
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
        }
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    pub fn change_detection_interval(&self) -> Duration {
        Duration::from_secs(self.change_detection_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn load_period(&self) -> Duration {
        Duration::from_millis(self.load_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.max_task_lifetime_secs, 300);
        assert_eq!(config.pass_interval(), Duration::from_secs(1));
        assert_eq!(config.change_detection_interval(), Duration::from_secs(30));
        assert_eq!(config.load_period(), Duration::from_secs(60));
        assert_eq!(config.max_batch_size, 500);
    }

    #[test]
    fn resolved_worker_threads() {
        let mut config = SchedulerConfig::default();
        // 0 means auto-detect
        assert!(config.resolved_worker_threads() > 0);

        config.worker_threads = 8;
        assert_eq!(config.resolved_worker_threads(), 8);
        assert_eq!(config.pool_config().workers, 8);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: SchedulerConfig = toml::from_str(
            "worker_threads = 2\nmax_task_lifetime_secs = 30\nerror_backoff_ms = 10",
        )
        .unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.pool_config().max_task_lifetime, Some(Duration::from_secs(30)));
        assert_eq!(config.error_backoff(), Duration::from_millis(10));
        assert_eq!(config.grace_timeout_ms, 5_000);
    }

    #[test]
    fn zero_lifetime_disables_reclamation() {
        let config = SchedulerConfig {
            max_task_lifetime_secs: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.pool_config().max_task_lifetime, None);
    }
}
