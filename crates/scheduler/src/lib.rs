//! Traversal scheduling engine.
//!
//! A [`TraversalScheduler`] walks every known connector once per pass and
//! hands bounded batches of traversal work to a [`WorkerPool`]. Each
//! connector is driven by its own [`ConnectorCoordinator`], paced by the
//! [`HostLoadThrottle`], and kept in sync with edits from cooperating
//! processes by the [`ChangeDetector`].

pub mod change_detector;
pub mod context;
pub mod coordinator;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod runner;
pub mod store;
pub mod synthetic;
pub mod throttle;
pub mod traversal;
pub mod types;

#[cfg(test)]
mod testing;

pub use change_detector::{ChangeDetector, ChangeListener, ChangeSummary};
pub use context::SchedulerContext;
pub use coordinator::{BatchResultRecorder, ConnectorCoordinator, CoordinatorPhase};
pub use manager::ConnectorManager;
pub use metrics::SchedulerMetrics;
pub use pool::{CancelToken, CancelableTask, PoolConfig, TaskHandle, WorkerPool};
pub use runner::TraversalScheduler;
pub use store::{InMemoryStore, PersistedStore};
pub use synthetic::SyntheticType;
pub use throttle::{FinishAction, HostLoadThrottle};
pub use traversal::{
    CheckpointCell, ConnectorType, ConnectorTypeRegistry, DocumentBatch, QueryTraverser,
    TraversalError, TraversalManager, Traverser,
};
pub use types::SchedulerConfig;
