//! Connector registry and administrative entry points.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use conduit_core::{ConduitError, ConnectorConfig, Result, Schedule};

use crate::change_detector::ChangeListener;
use crate::context::SchedulerContext;
use crate::coordinator::ConnectorCoordinator;

/// Owns one [`ConnectorCoordinator`] per known connector.
///
/// Admin calls persist to the store and then apply to the live coordinator.
/// Change notifications only apply; the store already holds the value.
pub struct ConnectorManager {
    ctx: Arc<SchedulerContext>,
    coordinators: RwLock<BTreeMap<String, Arc<ConnectorCoordinator>>>,
}

impl ConnectorManager {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self {
            ctx,
            coordinators: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    pub fn coordinator(&self, name: &str) -> Option<Arc<ConnectorCoordinator>> {
        self.coordinators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<ConnectorCoordinator>> {
        self.coordinator(name)
            .ok_or_else(|| ConduitError::ConnectorNotFound(name.to_string()))
    }

    /// Look up a coordinator, creating it on first reference.
    fn get_or_create(&self, name: &str) -> Arc<ConnectorCoordinator> {
        if let Some(existing) = self.coordinator(name) {
            return existing;
        }
        let mut coordinators = self
            .coordinators
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(coordinators.entry(name.to_string()).or_insert_with(|| {
            debug!(connector = name, "coordinator created");
            ConnectorCoordinator::new(name, Arc::clone(&self.ctx))
        }))
    }

    fn detach(&self, name: &str) -> Option<Arc<ConnectorCoordinator>> {
        self.coordinators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Validate, persist and apply a connector configuration. Replacing an
    /// existing configuration restarts the traversal from scratch.
    pub fn set_connector_config(&self, name: &str, config: ConnectorConfig) -> Result<()> {
        self.ctx.connector_types.validate(name, &config)?;
        self.ctx.store.store_configuration(name, &config)?;

        let coordinator = self.get_or_create(name);
        let replaced = coordinator.configuration().is_some();
        let connector_type = config.connector_type.clone();
        if coordinator.set_configuration(config)? && replaced {
            coordinator.restart_connector_traversal()?;
        }
        info!(connector = name, connector_type = %connector_type, replaced, "connector configured");
        Ok(())
    }

    /// Parse, persist and apply a schedule in wire format.
    pub fn set_connector_schedule(&self, name: &str, schedule: &str) -> Result<()> {
        let schedule: Schedule = schedule.parse()?;
        let coordinator = self.require(name)?;
        self.ctx.store.store_schedule(name, &schedule)?;
        coordinator.set_schedule(schedule)?;
        info!(connector = name, "connector schedule set");
        Ok(())
    }

    /// Cancel in-flight work, drop all per-connector state and delete the
    /// connector from the store.
    pub fn remove_connector(&self, name: &str) -> Result<()> {
        let coordinator = self
            .detach(name)
            .ok_or_else(|| ConduitError::ConnectorNotFound(name.to_string()))?;
        coordinator.remove_connector();
        self.ctx.store.remove_task(name)?;
        Ok(())
    }

    pub fn restart_connector_traversal(&self, name: &str) -> Result<()> {
        self.require(name)?.restart_connector_traversal()
    }

    pub fn connector_names(&self) -> BTreeSet<String> {
        self.coordinators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of the live coordinators, sorted by name.
    pub fn coordinators(&self) -> Vec<Arc<ConnectorCoordinator>> {
        self.coordinators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl ChangeListener for ConnectorManager {
    fn connector_added(&self, name: &str, config: ConnectorConfig) -> Result<()> {
        let coordinator = self.get_or_create(name);
        coordinator.set_configuration(config)?;
        if let Some(schedule) = self.ctx.store.read_schedule(name)? {
            coordinator.set_schedule(schedule)?;
        }
        Ok(())
    }

    fn connector_removed(&self, name: &str) -> Result<()> {
        if let Some(coordinator) = self.detach(name) {
            coordinator.remove_connector();
        }
        Ok(())
    }

    fn checkpoint_changed(&self, name: &str, checkpoint: Option<String>) -> Result<()> {
        self.require(name)?.checkpoint_changed(checkpoint.as_deref())
    }

    fn configuration_changed(&self, name: &str, config: ConnectorConfig) -> Result<()> {
        self.require(name)?.set_configuration(config).map(drop)
    }

    fn schedule_changed(&self, name: &str, schedule: Option<Schedule>) -> Result<()> {
        match schedule {
            Some(schedule) => self.require(name)?.set_schedule(schedule).map(drop),
            None => {
                debug!(connector = name, "schedule cleared in store; keeping live schedule");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ConnectorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorManager")
            .field("connectors", &self.connector_names())
            .finish()
    }
}
