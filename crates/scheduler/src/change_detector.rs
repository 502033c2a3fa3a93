//! Detects edits made to the persisted store by cooperating processes.
//!
//! Each run lists the store's `(name -> stamps)` snapshot and merge-walks it
//! against the snapshot taken by the previous run. Both are sorted by name,
//! so the walk is a single pass with two cursors. Only facets whose stamp
//! moved are re-read.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use conduit_core::{ConnectorConfig, Result, Schedule, TaskStamps};

use crate::pool::CancelToken;
use crate::store::PersistedStore;

/// Receiver of change notifications.
pub trait ChangeListener: Send + Sync {
    fn connector_added(&self, name: &str, config: ConnectorConfig) -> Result<()>;

    fn connector_removed(&self, name: &str) -> Result<()>;

    fn checkpoint_changed(&self, name: &str, checkpoint: Option<String>) -> Result<()>;

    fn configuration_changed(&self, name: &str, config: ConnectorConfig) -> Result<()>;

    fn schedule_changed(&self, name: &str, schedule: Option<Schedule>) -> Result<()>;
}

/// Notification counts for one detection run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added + self.removed + self.changed == 0
    }
}

pub struct ChangeDetector {
    store: Arc<dyn PersistedStore>,
    listener: Arc<dyn ChangeListener>,
    inventory: Mutex<BTreeMap<String, TaskStamps>>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn PersistedStore>, listener: Arc<dyn ChangeListener>) -> Self {
        Self {
            store,
            listener,
            inventory: Mutex::new(BTreeMap::new()),
        }
    }

    /// Compare the store against the last snapshot and notify the listener.
    ///
    /// A failing listener call is logged and skipped. A failing store read
    /// aborts the run and keeps the previous snapshot, so the same changes
    /// are seen again next time.
    pub fn detect_changes(&self) -> Result<ChangeSummary> {
        let mut inventory = self.inventory.lock().unwrap_or_else(PoisonError::into_inner);
        let persisted = self.store.list_tasks()?;
        let mut summary = ChangeSummary::default();

        let mut old = inventory.iter().peekable();
        let mut new = persisted.iter().peekable();
        loop {
            let order = match (old.peek(), new.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((old_name, _)), Some((new_name, _))) => old_name.cmp(new_name),
            };
            match order {
                Ordering::Less => {
                    if let Some((name, _)) = old.next() {
                        self.removed(name);
                        summary.removed += 1;
                    }
                }
                Ordering::Greater => {
                    if let Some((name, _)) = new.next() {
                        if self.added(name)? {
                            summary.added += 1;
                        }
                    }
                }
                Ordering::Equal => {
                    if let (Some((name, before)), Some((_, after))) = (old.next(), new.next()) {
                        summary.changed += self.changed(name, before, after)?;
                    }
                }
            }
        }

        *inventory = persisted;
        if !summary.is_empty() {
            info!(
                added = summary.added,
                removed = summary.removed,
                changed = summary.changed,
                "store changes applied"
            );
        }
        Ok(summary)
    }

    fn removed(&self, name: &str) {
        debug!(connector = name, "connector removed from store");
        if let Err(e) = self.listener.connector_removed(name) {
            warn!(connector = name, error = %e, "failed to apply removal");
        }
    }

    fn added(&self, name: &str) -> Result<bool> {
        let Some(config) = self.store.read_configuration(name)? else {
            return Ok(false);
        };
        debug!(connector = name, connector_type = %config.connector_type, "connector added to store");
        if let Err(e) = self.listener.connector_added(name, config) {
            warn!(connector = name, error = %e, "failed to apply addition");
        }
        Ok(true)
    }

    /// Fire one notification per facet whose stamp moved, in checkpoint,
    /// configuration, schedule order.
    fn changed(&self, name: &str, before: &TaskStamps, after: &TaskStamps) -> Result<usize> {
        let mut fired = 0;
        if before.checkpoint != after.checkpoint {
            let checkpoint = self.store.read_checkpoint(name)?;
            self.notify(name, "checkpoint", self.listener.checkpoint_changed(name, checkpoint));
            fired += 1;
        }
        if before.configuration != after.configuration {
            if let Some(config) = self.store.read_configuration(name)? {
                self.notify(name, "configuration", self.listener.configuration_changed(name, config));
                fired += 1;
            }
        }
        if before.schedule != after.schedule {
            let schedule = self.store.read_schedule(name)?;
            self.notify(name, "schedule", self.listener.schedule_changed(name, schedule));
            fired += 1;
        }
        Ok(fired)
    }

    fn notify(&self, name: &str, facet: &str, outcome: Result<()>) {
        match outcome {
            Ok(()) => debug!(connector = name, facet, "change applied"),
            Err(e) => warn!(connector = name, facet, error = %e, "failed to apply change"),
        }
    }

    /// Run detection every `interval` on a background thread until `stop`
    /// is cancelled.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        stop: CancelToken,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("change-detector".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "change detector started");
                while !stop.wait_timeout(interval) {
                    if let Err(e) = self.detect_changes() {
                        warn!(error = %e, "change detection failed");
                    }
                }
                info!("change detector stopped");
            })
    }
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let known = self
            .inventory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ChangeDetector").field("known", &known).finish()
    }
}
