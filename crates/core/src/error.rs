use thiserror::Error;

use crate::schedule::ScheduleError;

#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connector not found: {0}")]
    ConnectorNotFound(String),

    #[error("Unknown connector type: {0}")]
    UnknownConnectorType(String),

    #[error("Malformed schedule: {0}")]
    MalformedSchedule(#[from] ScheduleError),

    #[error("Connector {connector} rejected configuration: {reason}")]
    AdapterRejected { connector: String, reason: String },

    #[error("Traversal failed: {0}")]
    Traversal(String),

    #[error("Batch timed out: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Worker pool needs at least one worker, got {0}")]
    InvalidWorkerCount(usize),

    #[error("Worker pool is shut down")]
    PoolShutDown,
}

pub type Result<T> = std::result::Result<T, ConduitError>;
