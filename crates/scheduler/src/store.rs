//! Persisted source of truth for connector configuration, schedules and
//! checkpoints.
//!
//! Every write bumps the stamp of the facet it touches. The change detector
//! compares stamp snapshots to find out what other processes sharing the
//! store have edited.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use conduit_core::{ConnectorConfig, Result, Schedule, Stamp, TaskStamps};

/// Storage backend consumed by the scheduler.
pub trait PersistedStore: Send + Sync + fmt::Debug {
    /// Connectors with a stored configuration, keyed and sorted by name.
    fn list_tasks(&self) -> Result<BTreeMap<String, TaskStamps>>;

    fn read_configuration(&self, name: &str) -> Result<Option<ConnectorConfig>>;

    fn read_schedule(&self, name: &str) -> Result<Option<Schedule>>;

    fn read_checkpoint(&self, name: &str) -> Result<Option<String>>;

    fn store_configuration(&self, name: &str, config: &ConnectorConfig) -> Result<()>;

    fn store_schedule(&self, name: &str, schedule: &Schedule) -> Result<()>;

    /// Store a checkpoint; `None` clears it.
    fn store_checkpoint(&self, name: &str, checkpoint: Option<&str>) -> Result<()>;

    /// Drop every facet of a connector.
    fn remove_task(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct StoredTask {
    configuration: Option<(Stamp, ConnectorConfig)>,
    schedule: Option<(Stamp, Schedule)>,
    checkpoint: Option<(Stamp, String)>,
}

impl StoredTask {
    fn stamps(&self) -> TaskStamps {
        TaskStamps::new(
            self.configuration.as_ref().map(|(s, _)| *s),
            self.schedule.as_ref().map(|(s, _)| *s),
            self.checkpoint.as_ref().map(|(s, _)| *s),
        )
    }
}

/// Process-local store. Sharing one instance between several managers
/// models cooperating processes on a common backend.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tasks: Mutex<BTreeMap<String, StoredTask>>,
    next_stamp: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StoredTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stamp(&self) -> Stamp {
        Stamp(self.next_stamp.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl PersistedStore for InMemoryStore {
    fn list_tasks(&self) -> Result<BTreeMap<String, TaskStamps>> {
        Ok(self
            .lock()
            .iter()
            .filter(|(_, task)| task.configuration.is_some())
            .map(|(name, task)| (name.clone(), task.stamps()))
            .collect())
    }

    fn read_configuration(&self, name: &str) -> Result<Option<ConnectorConfig>> {
        Ok(self
            .lock()
            .get(name)
            .and_then(|t| t.configuration.as_ref().map(|(_, c)| c.clone())))
    }

    fn read_schedule(&self, name: &str) -> Result<Option<Schedule>> {
        Ok(self
            .lock()
            .get(name)
            .and_then(|t| t.schedule.as_ref().map(|(_, s)| s.clone())))
    }

    fn read_checkpoint(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .get(name)
            .and_then(|t| t.checkpoint.as_ref().map(|(_, c)| c.clone())))
    }

    fn store_configuration(&self, name: &str, config: &ConnectorConfig) -> Result<()> {
        let stamp = self.stamp();
        self.lock().entry(name.to_string()).or_default().configuration = Some((stamp, config.clone()));
        Ok(())
    }

    fn store_schedule(&self, name: &str, schedule: &Schedule) -> Result<()> {
        let stamp = self.stamp();
        self.lock().entry(name.to_string()).or_default().schedule = Some((stamp, schedule.clone()));
        Ok(())
    }

    fn store_checkpoint(&self, name: &str, checkpoint: Option<&str>) -> Result<()> {
        let stamp = self.stamp();
        let mut tasks = self.lock();
        let task = tasks.entry(name.to_string()).or_default();
        task.checkpoint = checkpoint.map(|c| (stamp, c.to_string()));
        Ok(())
    }

    fn remove_task(&self, name: &str) -> Result<()> {
        self.lock().remove(name);
        Ok(())
    }
}
