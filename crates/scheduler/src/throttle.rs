//! Per-connector host load throttling.
//!
//! Each connector's schedule carries a load ceiling in documents per minute.
//! The throttle budgets that load over a rolling `load_period`, turns the
//! remaining budget into a batch size hint, and holds the backoff window
//! armed by the previous batch's delay policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use conduit_core::Clock;

/// What the caller must do after reporting a finished traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    Continue,
    /// The retry delay was the polling-disabled sentinel.
    DisableSchedule,
}

#[derive(Debug, Clone)]
struct LoadEntry {
    period_start: DateTime<Utc>,
    docs_in_period: u64,
    delay_until: Option<DateTime<Utc>>,
    /// Documents per minute measured over the current period.
    throughput: f64,
}

impl LoadEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            period_start: now,
            docs_in_period: 0,
            delay_until: None,
            throughput: 0.0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>, period: chrono::Duration) {
        if now >= self.period_start + period {
            self.period_start = now;
            self.docs_in_period = 0;
        }
    }
}

pub struct HostLoadThrottle {
    clock: Arc<dyn Clock>,
    load_period: chrono::Duration,
    max_batch_size: usize,
    entries: Mutex<HashMap<String, LoadEntry>>,
}

impl HostLoadThrottle {
    pub fn new(clock: Arc<dyn Clock>, load_period: Duration, max_batch_size: usize) -> Self {
        Self {
            clock,
            load_period: chrono::Duration::from_std(load_period)
                .unwrap_or_else(|_| chrono::Duration::minutes(1)),
            max_batch_size,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LoadEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while the backoff armed by the previous batch is still active.
    pub fn should_delay(&self, connector: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .get(connector)
            .and_then(|e| e.delay_until)
            .is_some_and(|until| now < until)
    }

    /// Maximum number of items the next batch may process; 0 means do not
    /// run a batch now.
    pub fn determine_batch_hint(&self, connector: &str, load_per_minute: u32) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries
            .entry(connector.to_string())
            .or_insert_with(|| LoadEntry::new(now));
        entry.roll(now, self.load_period);

        let period_secs = self.load_period.num_milliseconds() as f64 / 1000.0;
        let budget = (f64::from(load_per_minute) * period_secs / 60.0).floor() as u64;
        let remaining = budget.saturating_sub(entry.docs_in_period);
        let hint = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.max_batch_size);
        if hint == 0 {
            debug!(connector, budget, traversed = entry.docs_in_period, "load budget exhausted");
        }
        hint
    }

    /// Fold a finished batch's item count into the load accounting.
    pub fn update_num_docs_traversed(&self, connector: &str, count: usize) {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries
            .entry(connector.to_string())
            .or_insert_with(|| LoadEntry::new(now));
        entry.roll(now, self.load_period);
        entry.docs_in_period += count as u64;

        let elapsed_secs = ((now - entry.period_start).num_milliseconds() as f64 / 1000.0).max(1.0);
        entry.throughput = entry.docs_in_period as f64 * 60.0 / elapsed_secs;
    }

    /// Arm the backoff window. `None` is the polling-disabled sentinel: no
    /// window is armed and the caller must disable the schedule.
    pub fn connector_finished_traversal(&self, connector: &str, delay: Option<Duration>) -> FinishAction {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries
            .entry(connector.to_string())
            .or_insert_with(|| LoadEntry::new(now));

        match delay {
            None => {
                entry.delay_until = None;
                FinishAction::DisableSchedule
            }
            Some(d) if d.is_zero() => {
                entry.delay_until = None;
                FinishAction::Continue
            }
            Some(d) => {
                let d = chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX);
                entry.delay_until = now.checked_add_signed(d);
                FinishAction::Continue
            }
        }
    }

    /// When the current backoff ends, if one is armed.
    pub fn delayed_until(&self, connector: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.lock()
            .get(connector)
            .and_then(|e| e.delay_until)
            .filter(|until| now < *until)
    }

    /// Documents per minute over the current load period.
    pub fn throughput(&self, connector: &str) -> Option<f64> {
        self.lock().get(connector).map(|e| e.throughput)
    }

    pub fn remove_connector(&self, connector: &str) {
        self.lock().remove(connector);
    }

    pub fn tracked_connectors(&self) -> usize {
        self.lock().len()
    }
}

impl std::fmt::Debug for HostLoadThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLoadThrottle")
            .field("load_period", &self.load_period)
            .field("max_batch_size", &self.max_batch_size)
            .field("tracked", &self.tracked_connectors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use conduit_core::ManualClock;

    use super::*;

    fn setup() -> (Arc<ManualClock>, HostLoadThrottle) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let throttle = HostLoadThrottle::new(clock.clone(), Duration::from_secs(60), 500);
        (clock, throttle)
    }

    #[test]
    fn hint_follows_load_budget() {
        let (_, throttle) = setup();
        assert_eq!(throttle.determine_batch_hint("c", 10), 10);
        throttle.update_num_docs_traversed("c", 4);
        assert_eq!(throttle.determine_batch_hint("c", 10), 6);
        throttle.update_num_docs_traversed("c", 6);
        assert_eq!(throttle.determine_batch_hint("c", 10), 0);
    }

    #[test]
    fn budget_resets_after_period() {
        let (clock, throttle) = setup();
        throttle.determine_batch_hint("c", 10);
        throttle.update_num_docs_traversed("c", 10);
        assert_eq!(throttle.determine_batch_hint("c", 10), 0);

        clock.advance(Duration::from_secs(61));
        assert_eq!(throttle.determine_batch_hint("c", 10), 10);
    }

    #[test]
    fn hint_is_capped_by_max_batch_size() {
        let (_, throttle) = setup();
        assert_eq!(throttle.determine_batch_hint("c", 100_000), 500);
        assert_eq!(throttle.determine_batch_hint("idle", 0), 0);
    }

    #[test]
    fn backoff_window_expires() {
        let (clock, throttle) = setup();
        assert!(!throttle.should_delay("c"));

        let action = throttle.connector_finished_traversal("c", Some(Duration::from_secs(5)));
        assert_eq!(action, FinishAction::Continue);
        assert!(throttle.should_delay("c"));
        assert!(throttle.delayed_until("c").is_some());

        clock.advance(Duration::from_secs(4));
        assert!(throttle.should_delay("c"));
        clock.advance(Duration::from_secs(1));
        assert!(!throttle.should_delay("c"));
    }

    #[test]
    fn immediate_clears_backoff() {
        let (_, throttle) = setup();
        throttle.connector_finished_traversal("c", Some(Duration::from_secs(5)));
        throttle.connector_finished_traversal("c", Some(Duration::ZERO));
        assert!(!throttle.should_delay("c"));
    }

    #[test]
    fn polling_disabled_asks_caller_to_disable() {
        let (_, throttle) = setup();
        assert_eq!(
            throttle.connector_finished_traversal("c", None),
            FinishAction::DisableSchedule
        );
        assert!(!throttle.should_delay("c"));
    }

    #[test]
    fn throughput_is_measured_per_minute() {
        let (clock, throttle) = setup();
        throttle.determine_batch_hint("c", 100);
        clock.advance(Duration::from_secs(30));
        throttle.update_num_docs_traversed("c", 20);
        let rate = throttle.throughput("c").unwrap();
        assert!((rate - 40.0).abs() < 0.01, "expected 40/min, got {}", rate);
    }

    #[test]
    fn removal_drops_state() {
        let (_, throttle) = setup();
        throttle.update_num_docs_traversed("c", 3);
        throttle.connector_finished_traversal("c", Some(Duration::from_secs(5)));
        assert_eq!(throttle.tracked_connectors(), 1);

        throttle.remove_connector("c");
        assert_eq!(throttle.tracked_connectors(), 0);
        assert!(!throttle.should_delay("c"));
        assert_eq!(throttle.throughput("c"), None);
    }
}
