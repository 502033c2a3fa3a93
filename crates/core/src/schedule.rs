//! Connector traversal schedules and their colon-delimited wire format.
//!
//! A schedule is stored as a single string:
//!
//! ```text
//! ["#"]name:load:retryDelayMillis:start-end[:start-end...]
//! ```
//!
//! Three historical versions must keep parsing:
//! 1. `name:load:intervals` (no retry delay, default applies)
//! 2. `name:load:retryDelayMillis:intervals`
//! 3. version 2 with an optional leading `#` marking the schedule disabled
//!
//! Interval hours are local time, half-open `[start, end)`. An `end` of `0`
//! means 24, `start == end` is the legacy way of disabling a schedule, and
//! `end < start` wraps past midnight and is stored as two intervals.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire value of the retry delay that turns polling off.
pub const POLLING_DISABLED: i64 = -1;

/// Retry delay applied to version 1 strings, which carry none.
pub const DEFAULT_RETRY_DELAY_MILLIS: u64 = 300_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("empty schedule string")]
    Empty,

    #[error("expected at least name and load, got {0:?}")]
    MissingFields(String),

    #[error("invalid connector name {0:?}")]
    InvalidName(String),

    #[error("invalid {field} value {value:?}")]
    BadNumber { field: &'static str, value: String },

    #[error("invalid retry delay {0}")]
    BadRetryDelay(i64),

    #[error("invalid interval {0:?}")]
    BadInterval(String),

    #[error("hour {0} out of range")]
    HourOutOfRange(u32),
}

/// How long to wait before polling a connector that ran out of new content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryDelay {
    Millis(u64),
    /// Stop traversing after the current content is exhausted.
    PollingDisabled,
}

impl RetryDelay {
    /// The wait as a duration, or `None` when polling is disabled.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            RetryDelay::Millis(ms) => Some(Duration::from_millis(*ms)),
            RetryDelay::PollingDisabled => None,
        }
    }

    fn from_wire(value: i64) -> Result<Self, ScheduleError> {
        match value {
            POLLING_DISABLED => Ok(RetryDelay::PollingDisabled),
            v if v >= 0 => Ok(RetryDelay::Millis(v as u64)),
            v => Err(ScheduleError::BadRetryDelay(v)),
        }
    }

    fn to_wire(self) -> i64 {
        match self {
            RetryDelay::Millis(ms) => ms as i64,
            RetryDelay::PollingDisabled => POLLING_DISABLED,
        }
    }
}

/// Half-open hour range `[start, end)`. `end` may reach 48 only for the
/// synthetic next-day copy used for lookahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourInterval {
    start: u32,
    end: u32,
}

impl HourInterval {
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn contains(&self, hour: u32) -> bool {
        self.start <= hour && hour < self.end
    }

    fn next_day(&self) -> Self {
        Self {
            start: self.start + 24,
            end: self.end + 24,
        }
    }
}

impl fmt::Display for HourInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Immutable traversal schedule for one connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    name: String,
    disabled: bool,
    load: u32,
    retry_delay: RetryDelay,
    /// Sorted, deduplicated, wrap-split intervals.
    intervals: Vec<HourInterval>,
    /// Copy of the earliest interval shifted by 24h.
    tomorrow: Option<HourInterval>,
}

impl Schedule {
    /// Build a schedule from raw `(start, end)` hour pairs as they appear on
    /// the wire, applying the `end == 0`, `start == end` and wraparound rules.
    pub fn new(
        name: impl Into<String>,
        disabled: bool,
        load: u32,
        retry_delay: RetryDelay,
        raw_intervals: impl IntoIterator<Item = (u32, u32)>,
    ) -> Result<Self, ScheduleError> {
        let name = name.into();
        if name.is_empty() || name.contains(':') || name.starts_with('#') {
            return Err(ScheduleError::InvalidName(name));
        }

        let mut disabled = disabled;
        let mut intervals = Vec::new();
        for (start, end) in raw_intervals {
            if start > 23 {
                return Err(ScheduleError::HourOutOfRange(start));
            }
            if end > 24 {
                return Err(ScheduleError::HourOutOfRange(end));
            }
            if start == end {
                disabled = true;
                continue;
            }
            let end = if end == 0 { 24 } else { end };
            if end < start {
                intervals.push(HourInterval { start, end: 24 });
                intervals.push(HourInterval { start: 0, end });
            } else {
                intervals.push(HourInterval { start, end });
            }
        }
        intervals.sort();
        intervals.dedup();
        let tomorrow = intervals.first().map(HourInterval::next_day);

        Ok(Self {
            name,
            disabled,
            load,
            retry_delay,
            intervals,
            tomorrow,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Documents per minute ceiling.
    pub fn load(&self) -> u32 {
        self.load
    }

    pub fn retry_delay(&self) -> RetryDelay {
        self.retry_delay
    }

    pub fn intervals(&self) -> &[HourInterval] {
        &self.intervals
    }

    /// Copy of this schedule with the disabled flag replaced.
    pub fn with_disabled(&self, disabled: bool) -> Self {
        Self {
            disabled,
            ..self.clone()
        }
    }

    /// True iff not disabled and `hour` (local, 0-23) falls inside an interval.
    pub fn should_run(&self, hour: u32) -> bool {
        !self.disabled && self.intervals.iter().any(|i| i.contains(hour))
    }

    /// Hours until the next allowed window opens: `Some(0)` while inside one,
    /// `None` if the schedule can never run.
    pub fn hours_until_next_window(&self, hour: u32) -> Option<u32> {
        if self.disabled {
            return None;
        }
        if self.should_run(hour) {
            return Some(0);
        }
        self.intervals
            .iter()
            .chain(self.tomorrow.iter())
            .map(HourInterval::start)
            .find(|start| *start > hour)
            .map(|start| start - hour)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.disabled {
            f.write_str("#")?;
        }
        write!(f, "{}:{}:{}:", self.name, self.load, self.retry_delay.to_wire())?;
        for (i, interval) in self.intervals.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{}", interval)?;
        }
        Ok(())
    }
}

fn parse_hour(text: &str, interval: &str) -> Result<u32, ScheduleError> {
    text.trim()
        .parse()
        .map_err(|_| ScheduleError::BadInterval(interval.to_string()))
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ScheduleError::Empty);
        }
        let (disabled, body) = match s.strip_prefix('#') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let fields: Vec<&str> = body.split(':').collect();
        if fields.len() < 2 {
            return Err(ScheduleError::MissingFields(s.to_string()));
        }
        let name = fields[0].trim();
        let load = fields[1]
            .trim()
            .parse::<u32>()
            .map_err(|_| ScheduleError::BadNumber {
                field: "load",
                value: fields[1].to_string(),
            })?;

        // Version 2+ carries a bare integer before the intervals; an interval
        // always contains a '-' between two hours and never parses as one.
        let rest = &fields[2..];
        let (retry_delay, interval_fields) = match rest.first().map(|f| f.trim().parse::<i64>()) {
            Some(Ok(value)) => (RetryDelay::from_wire(value)?, &rest[1..]),
            _ => (RetryDelay::Millis(DEFAULT_RETRY_DELAY_MILLIS), rest),
        };

        let mut raw = Vec::with_capacity(interval_fields.len());
        for field in interval_fields.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
            let (start, end) = field
                .split_once('-')
                .ok_or_else(|| ScheduleError::BadInterval(field.to_string()))?;
            raw.push((parse_hour(start, field)?, parse_hour(end, field)?));
        }

        Schedule::new(name, disabled, load, retry_delay, raw)
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.to_string()
    }
}
