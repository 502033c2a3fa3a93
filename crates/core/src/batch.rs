//! Batch outcomes and the legacy integer protocol they replace.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Legacy `run_batch` return value: no new content, poll again later.
pub const POLLING_WAIT: i64 = -2;

/// Legacy `run_batch` return value: the traversal failed, back off.
pub const ERROR_WAIT: i64 = -3;

/// What the scheduler should do before the next batch of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DelayPolicy {
    /// Run again as soon as possible.
    Immediate,
    /// No new content; wait for the schedule's retry delay.
    Poll,
    /// Something went wrong; wait for the error backoff.
    Error,
}

/// Outcome of one executed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub policy: DelayPolicy,
    /// Items processed by the batch.
    pub count: usize,
    /// Wall time spent inside the traversal call.
    #[serde(default)]
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn new(policy: DelayPolicy, count: usize) -> Self {
        Self {
            policy,
            count,
            elapsed: Duration::ZERO,
        }
    }

    /// Convert a legacy traversal return code into a tagged result.
    /// Unknown negative codes are treated as errors.
    pub fn from_legacy_code(code: i64) -> Self {
        match code {
            n if n >= 0 => Self::new(DelayPolicy::Immediate, n as usize),
            POLLING_WAIT => Self::new(DelayPolicy::Poll, 0),
            _ => Self::new(DelayPolicy::Error, 0),
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}
