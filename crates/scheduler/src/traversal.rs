//! Connector SPI: the type registry, the adapter-facing traversal manager,
//! and the scheduler-facing traverser that speaks the legacy batch protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use conduit_core::{ConduitError, ConnectorConfig, Result, ERROR_WAIT, POLLING_WAIT};

use crate::pool::CancelToken;
use crate::store::PersistedStore;

/// Failure reported by a repository adapter.
#[derive(Debug, thiserror::Error)]
pub enum TraversalError {
    #[error("Repository error: {0}")]
    Repository(String),
    #[error("Traversal cancelled")]
    Cancelled,
}

/// Documents handed over by one adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentBatch {
    pub count: usize,
    /// Position to resume from next time, if the adapter advanced.
    pub checkpoint: Option<String>,
}

/// Adapter side of a traversal. `Ok(None)` means no new content.
///
/// Implementations doing blocking repository work must check `cancel`
/// between units of work.
pub trait TraversalManager: Send {
    fn start_traversal(
        &mut self,
        max_items: usize,
        cancel: &CancelToken,
    ) -> std::result::Result<Option<DocumentBatch>, TraversalError>;

    fn resume_traversal(
        &mut self,
        checkpoint: &str,
        max_items: usize,
        cancel: &CancelToken,
    ) -> std::result::Result<Option<DocumentBatch>, TraversalError>;
}

/// A kind of connector the process knows how to instantiate.
pub trait ConnectorType: Send + Sync {
    fn type_name(&self) -> &str;

    /// Reject unusable configurations with a human-readable reason.
    fn validate_config(&self, _config: &ConnectorConfig) -> std::result::Result<(), String> {
        Ok(())
    }

    fn instantiate(
        &self,
        connector: &str,
        config: &ConnectorConfig,
    ) -> std::result::Result<Box<dyn TraversalManager>, String>;
}

/// Connector types selectable by `ConnectorConfig::connector_type`.
#[derive(Clone, Default)]
pub struct ConnectorTypeRegistry {
    types: BTreeMap<String, Arc<dyn ConnectorType>>,
}

impl ConnectorTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector_type: Arc<dyn ConnectorType>) {
        self.types
            .insert(connector_type.type_name().to_string(), connector_type);
    }

    pub fn with(mut self, connector_type: Arc<dyn ConnectorType>) -> Self {
        self.register(connector_type);
        self
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    fn lookup(&self, config: &ConnectorConfig) -> Result<&Arc<dyn ConnectorType>> {
        self.types
            .get(&config.connector_type)
            .ok_or_else(|| ConduitError::UnknownConnectorType(config.connector_type.clone()))
    }

    pub fn validate(&self, connector: &str, config: &ConnectorConfig) -> Result<()> {
        self.lookup(config)?
            .validate_config(config)
            .map_err(|reason| ConduitError::AdapterRejected {
                connector: connector.to_string(),
                reason,
            })
    }

    pub fn instantiate(
        &self,
        connector: &str,
        config: &ConnectorConfig,
    ) -> Result<Box<dyn TraversalManager>> {
        self.lookup(config)?
            .instantiate(connector, config)
            .map_err(|reason| ConduitError::AdapterRejected {
                connector: connector.to_string(),
                reason,
            })
    }
}

impl fmt::Debug for ConnectorTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorTypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

/// Scheduler-facing batch runner using the legacy integer protocol:
/// `>= 0` items processed, [`POLLING_WAIT`] or [`ERROR_WAIT`].
pub trait Traverser: Send + Sync {
    fn run_batch(&self, max_items: usize, cancel: &CancelToken) -> i64;

    /// Ask an in-progress `run_batch` to stop.
    fn cancel_batch(&self);
}

/// A connector's persisted checkpoint plus the last value this process
/// wrote or read, used to tell our own writes apart from foreign ones.
pub struct CheckpointCell {
    connector: String,
    store: Arc<dyn PersistedStore>,
    local: Mutex<Option<String>>,
}

impl CheckpointCell {
    pub fn new(connector: impl Into<String>, store: Arc<dyn PersistedStore>) -> Self {
        Self {
            connector: connector.into(),
            store,
            local: Mutex::new(None),
        }
    }

    // `local` stays locked across the store access so a concurrent
    // `matches_local` never sees the store ahead of it.
    pub fn read(&self) -> Result<Option<String>> {
        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let checkpoint = self.store.read_checkpoint(&self.connector)?;
        *local = checkpoint.clone();
        Ok(checkpoint)
    }

    pub fn write(&self, checkpoint: Option<&str>) -> Result<()> {
        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.store_checkpoint(&self.connector, checkpoint)?;
        *local = checkpoint.map(str::to_string);
        Ok(())
    }

    /// Whether `checkpoint` is what this process last saw.
    pub fn matches_local(&self, checkpoint: Option<&str>) -> bool {
        self.local.lock().unwrap_or_else(PoisonError::into_inner).as_deref() == checkpoint
    }
}

impl fmt::Debug for CheckpointCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCell")
            .field("connector", &self.connector)
            .finish()
    }
}

/// [`Traverser`] over a [`TraversalManager`]: starts a fresh traversal when
/// no checkpoint is stored and resumes otherwise.
pub struct QueryTraverser {
    connector: String,
    manager: Mutex<Box<dyn TraversalManager>>,
    checkpoint: Arc<CheckpointCell>,
    current: Mutex<Option<CancelToken>>,
}

impl QueryTraverser {
    pub fn new(
        connector: impl Into<String>,
        manager: Box<dyn TraversalManager>,
        checkpoint: Arc<CheckpointCell>,
    ) -> Self {
        Self {
            connector: connector.into(),
            manager: Mutex::new(manager),
            checkpoint,
            current: Mutex::new(None),
        }
    }
}

impl Traverser for QueryTraverser {
    fn run_batch(&self, max_items: usize, cancel: &CancelToken) -> i64 {
        if cancel.is_cancelled() {
            return 0;
        }
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        let checkpoint = match self.checkpoint.read() {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(connector = %self.connector, error = %e, "failed to read checkpoint");
                return ERROR_WAIT;
            }
        };

        let outcome = {
            let mut manager = self.manager.lock().unwrap_or_else(PoisonError::into_inner);
            match checkpoint.as_deref() {
                None => {
                    debug!(connector = %self.connector, max_items, "starting traversal");
                    manager.start_traversal(max_items, cancel)
                }
                Some(checkpoint) => {
                    debug!(connector = %self.connector, max_items, checkpoint, "resuming traversal");
                    manager.resume_traversal(checkpoint, max_items, cancel)
                }
            }
        };
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;

        match outcome {
            Err(e) => {
                let err = ConduitError::Traversal(e.to_string());
                warn!(connector = %self.connector, error = %err, "traversal failed");
                ERROR_WAIT
            }
            Ok(None) => POLLING_WAIT,
            Ok(Some(batch)) => {
                if cancel.is_cancelled() {
                    debug!(connector = %self.connector, "batch cancelled; checkpoint not saved");
                    return batch.count as i64;
                }
                if let Some(next) = batch.checkpoint.as_deref() {
                    if let Err(e) = self.checkpoint.write(Some(next)) {
                        warn!(connector = %self.connector, error = %e, "failed to save checkpoint");
                        return ERROR_WAIT;
                    }
                }
                batch.count as i64
            }
        }
    }

    fn cancel_batch(&self) {
        if let Some(token) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }
}
