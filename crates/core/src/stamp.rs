//! Version stamps for the three persisted facets of a connector.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, totally ordered version marker for one facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp(pub u64);

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration, schedule and checkpoint stamps for one connector.
///
/// `None` sorts below any present stamp, so a facet that disappears or
/// appears between two snapshots always compares as changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskStamps {
    pub configuration: Option<Stamp>,
    pub schedule: Option<Stamp>,
    pub checkpoint: Option<Stamp>,
}

impl TaskStamps {
    pub fn new(
        configuration: Option<Stamp>,
        schedule: Option<Stamp>,
        checkpoint: Option<Stamp>,
    ) -> Self {
        Self {
            configuration,
            schedule,
            checkpoint,
        }
    }

    /// Same stamp in all three facets; handy for tests and fresh inventories.
    pub fn uniform(stamp: u64) -> Self {
        Self::new(Some(Stamp(stamp)), Some(Stamp(stamp)), Some(Stamp(stamp)))
    }
}
