use std::time::Duration;

use crate::error::ConfigError;

const SECONDS_PER_MINUTE: u64 = 60;

/// Minutes between scheduled wakes, from one minute up to a week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordInterval(u32);

impl RecordInterval {
    pub const MIN_MINUTES: u32 = 1;
    /// Well inside the RTC timer range on every target.
    pub const MAX_MINUTES: u32 = 7 * 24 * 60;

    pub fn from_minutes(minutes: i64) -> Result<Self, ConfigError> {
        if minutes < i64::from(Self::MIN_MINUTES) {
            return Err(ConfigError::IntervalTooSmall(minutes));
        }
        if minutes > i64::from(Self::MAX_MINUTES) {
            return Err(ConfigError::IntervalTooLarge(minutes));
        }
        u32::try_from(minutes)
            .map(Self)
            .map_err(|_| ConfigError::InvalidInterval(minutes.to_string()))
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let minutes = raw
            .trim()
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidInterval(raw.to_string()))?;
        Self::from_minutes(minutes)
    }

    pub fn minutes(self) -> u32 {
        self.0
    }
}

impl Default for RecordInterval {
    fn default() -> Self {
        Self(2)
    }
}

/// A request to suspend until the next scheduled wake. Issuing it ends the
/// current boot; the device resumes at the wake classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepRequest {
    duration: Duration,
}

impl SleepRequest {
    pub fn for_interval(interval: RecordInterval) -> Self {
        Self {
            duration: Duration::from_secs(u64::from(interval.minutes()) * SECONDS_PER_MINUTE),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Duration in the low-power timer's unit.
    pub fn as_micros(&self) -> u64 {
        u64::try_from(self.duration.as_micros()).unwrap_or(u64::MAX)
    }
}
