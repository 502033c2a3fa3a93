use std::sync::Arc;

use conduit_core::{Clock, Result, SystemClock};

use crate::pool::WorkerPool;
use crate::store::PersistedStore;
use crate::throttle::HostLoadThrottle;
use crate::traversal::ConnectorTypeRegistry;
use crate::types::SchedulerConfig;

/// Process-wide collaborators, built once at startup and shared by every
/// coordinator, the scheduling loop and the change detector.
#[derive(Debug)]
pub struct SchedulerContext {
    pub config: SchedulerConfig,
    pub clock: Arc<dyn Clock>,
    pub pool: WorkerPool,
    pub throttle: HostLoadThrottle,
    pub store: Arc<dyn PersistedStore>,
    pub connector_types: ConnectorTypeRegistry,
}

impl SchedulerContext {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn PersistedStore>,
        connector_types: ConnectorTypeRegistry,
    ) -> Result<Arc<Self>> {
        Self::with_clock(config, store, connector_types, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SchedulerConfig,
        store: Arc<dyn PersistedStore>,
        connector_types: ConnectorTypeRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let pool = WorkerPool::new(config.pool_config())?;
        let throttle =
            HostLoadThrottle::new(Arc::clone(&clock), config.load_period(), config.max_batch_size);
        Ok(Arc::new(Self {
            config,
            clock,
            pool,
            throttle,
            store,
            connector_types,
        }))
    }
}
