use std::fmt;
use std::time::Duration;

use thiserror::Error;
use time::macros::format_description;
use time::{OffsetDateTime, Time, UtcOffset};

pub const DEFAULT_INTERVAL_HOURS: u64 = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid daily schedule {0:?}, expected HH:MM")]
    InvalidTime(String),
    #[error("run interval must be at least one hour")]
    ZeroInterval,
}

/// When the daemon starts its next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// A fixed delay after the previous run finished.
    Interval(Duration),
    /// Every day at the given UTC wall-clock time.
    Daily(Time),
}

impl Schedule {
    pub fn every_hours(hours: u64) -> Result<Self, ScheduleError> {
        if hours == 0 {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(Schedule::Interval(Duration::from_secs(hours * 60 * 60)))
    }

    /// Parses a daily `HH:MM` trigger.
    pub fn daily(raw: &str) -> Result<Self, ScheduleError> {
        let format = format_description!("[hour]:[minute]");
        Time::parse(raw.trim(), format)
            .map(Schedule::Daily)
            .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
    }

    pub fn next_run(&self, now: OffsetDateTime) -> OffsetDateTime {
        match *self {
            Schedule::Interval(interval) => now + interval,
            Schedule::Daily(at) => {
                let now = now.to_offset(UtcOffset::UTC);
                let today = now.replace_time(at);
                if today > now {
                    today
                } else {
                    today + time::Duration::DAY
                }
            }
        }
    }

    /// How long to sleep from `now` until [`Schedule::next_run`].
    pub fn delay_from(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(self.next_run(now) - now).unwrap_or_default()
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Interval(Duration::from_secs(DEFAULT_INTERVAL_HOURS * 60 * 60))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(interval) => write!(f, "every {}h", interval.as_secs() / 3600),
            Schedule::Daily(at) => write!(f, "daily at {:02}:{:02} UTC", at.hour(), at.minute()),
        }
    }
}
