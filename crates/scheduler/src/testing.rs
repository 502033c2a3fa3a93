//! Shared fixtures for the scheduler's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use conduit_core::{BatchResult, Clock, ConnectorConfig, ManualClock};

use crate::context::SchedulerContext;
use crate::coordinator::BatchResultRecorder;
use crate::pool::CancelToken;
use crate::store::InMemoryStore;
use crate::traversal::{ConnectorType, ConnectorTypeRegistry, DocumentBatch, TraversalError, TraversalManager};
use crate::types::SchedulerConfig;

pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Noon, 1 May 2024, UTC.
pub(crate) fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Start { max: usize },
    Resume { checkpoint: String, max: usize },
}

/// Behavior shared by every traversal manager a [`ScriptedType`] creates.
#[derive(Default)]
pub(crate) struct Script {
    pages: Mutex<VecDeque<usize>>,
    calls: Mutex<Vec<Call>>,
    instantiated: Mutex<Vec<ConnectorConfig>>,
    /// Park each call on its cancel token until cancelled.
    pub block: AtomicBool,
    pub fail: AtomicBool,
    /// Sleep this long on every call without looking at the cancel token.
    pub stall_ms: AtomicU64,
    pub entered: AtomicUsize,
}

impl Script {
    /// Item counts returned by successive calls; once exhausted every call
    /// reports no new content.
    pub fn with_pages(pages: &[usize]) -> Arc<Self> {
        let script = Self::default();
        script.pages.lock().unwrap().extend(pages.iter().copied());
        Arc::new(script)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn instantiated(&self) -> Vec<ConnectorConfig> {
        self.instantiated.lock().unwrap().clone()
    }

    fn step(
        &self,
        base: usize,
        max: usize,
        cancel: &CancelToken,
    ) -> Result<Option<DocumentBatch>, TraversalError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            std::thread::sleep(Duration::from_millis(stall));
        }
        if self.block.load(Ordering::SeqCst) && cancel.wait_timeout(Duration::from_secs(5)) {
            return Err(TraversalError::Cancelled);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TraversalError::Repository("repository offline".to_string()));
        }
        match self.pages.lock().unwrap().pop_front() {
            None => Ok(None),
            Some(count) => {
                let count = count.min(max);
                Ok(Some(DocumentBatch {
                    count,
                    checkpoint: Some((base + count).to_string()),
                }))
            }
        }
    }
}

struct ScriptedManager {
    script: Arc<Script>,
}

impl TraversalManager for ScriptedManager {
    fn start_traversal(
        &mut self,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<Option<DocumentBatch>, TraversalError> {
        self.script.calls.lock().unwrap().push(Call::Start { max: max_items });
        self.script.step(0, max_items, cancel)
    }

    fn resume_traversal(
        &mut self,
        checkpoint: &str,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<Option<DocumentBatch>, TraversalError> {
        self.script.calls.lock().unwrap().push(Call::Resume {
            checkpoint: checkpoint.to_string(),
            max: max_items,
        });
        let base = checkpoint.parse().unwrap_or(0);
        self.script.step(base, max_items, cancel)
    }
}

/// Connector type `scripted`. Rejects configurations with `reject=true`.
pub(crate) struct ScriptedType {
    pub script: Arc<Script>,
}

impl ConnectorType for ScriptedType {
    fn type_name(&self) -> &str {
        "scripted"
    }

    fn validate_config(&self, config: &ConnectorConfig) -> Result<(), String> {
        match config.param("reject") {
            Some("true") => Err("rejected by test".to_string()),
            _ => Ok(()),
        }
    }

    fn instantiate(
        &self,
        _connector: &str,
        config: &ConnectorConfig,
    ) -> Result<Box<dyn TraversalManager>, String> {
        self.script.instantiated.lock().unwrap().push(config.clone());
        Ok(Box::new(ScriptedManager {
            script: Arc::clone(&self.script),
        }))
    }
}

pub(crate) fn scripted_config(version: &str) -> ConnectorConfig {
    ConnectorConfig::new("scripted").with_param("version", version)
}

/// Sink recording every result with the clock time it arrived at.
pub(crate) struct RecordingSink {
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<(String, BatchResult, DateTime<Utc>)>>,
}

impl RecordingSink {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn results(&self) -> Vec<BatchResult> {
        self.entries.lock().unwrap().iter().map(|(_, r, _)| r.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, BatchResult, DateTime<Utc>)> {
        self.entries.lock().unwrap().clone()
    }
}

impl BatchResultRecorder for RecordingSink {
    fn record_result(&self, connector: &str, result: &BatchResult) {
        self.entries
            .lock()
            .unwrap()
            .push((connector.to_string(), result.clone(), self.clock.now()));
    }
}

pub(crate) fn test_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        worker_threads: workers,
        grace_timeout_ms: 100,
        monitor_interval_ms: 10,
        pass_interval_ms: 10,
        error_backoff_ms: 60_000,
        shutdown_timeout_ms: 1_000,
        ..SchedulerConfig::default()
    }
}

pub(crate) struct Fixture {
    pub ctx: Arc<SchedulerContext>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
    pub script: Arc<Script>,
    pub sink: Arc<RecordingSink>,
}

impl Fixture {
    pub fn new(config: SchedulerConfig, script: Arc<Script>) -> Self {
        let clock = Arc::new(ManualClock::new(noon()));
        Self::with_store(config, script, clock, Arc::new(InMemoryStore::new()))
    }

    /// A second process sharing `store` and `clock`.
    pub fn with_store(
        config: SchedulerConfig,
        script: Arc<Script>,
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
    ) -> Self {
        let types = ConnectorTypeRegistry::new().with(Arc::new(ScriptedType {
            script: Arc::clone(&script),
        }));
        let ctx = SchedulerContext::with_clock(config, store.clone(), types, clock.clone()).unwrap();
        let sink = RecordingSink::new(clock.clone());
        Self {
            ctx,
            clock,
            store,
            script,
            sink,
        }
    }
}
