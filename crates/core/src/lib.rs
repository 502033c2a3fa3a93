pub mod batch;
pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod schedule;
pub mod stamp;

pub use batch::{BatchResult, DelayPolicy, ERROR_WAIT, POLLING_WAIT};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connector::ConnectorConfig;
pub use error::*;
pub use schedule::{HourInterval, RetryDelay, Schedule, ScheduleError};
pub use stamp::{Stamp, TaskStamps};
