use chrono::{Duration, NaiveDateTime};

use crate::error::{ClockError, TimeError};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d %H:%M";
const PHONE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Wall clock used to stamp readings. Holds the user's local time; no
/// timezone state is kept.
pub trait WallClock {
    fn now(&self) -> NaiveDateTime;
    fn set(&mut self, local: NaiveDateTime) -> Result<(), ClockError>;
}

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Converts a browser `toISOString()` value plus its `getTimezoneOffset()`
/// (minutes, positive west of UTC) into local wall-clock time.
pub fn parse_phone_time(time: &str, offset_minutes: i64) -> Result<NaiveDateTime, TimeError> {
    let (parsed, _) = NaiveDateTime::parse_and_remainder(time.trim(), PHONE_TIME_FORMAT)
        .map_err(|_| TimeError::Unparseable(time.to_string()))?;

    let offset = Duration::try_minutes(offset_minutes).ok_or(TimeError::OutOfRange)?;
    parsed
        .checked_sub_signed(offset)
        .ok_or(TimeError::OutOfRange)
}

pub fn parse_offset(raw: &str) -> Result<i64, TimeError> {
    let offset = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| TimeError::InvalidOffset(raw.to_string()))?;

    if offset.abs() > 24 * 60 {
        return Err(TimeError::InvalidOffset(raw.to_string()));
    }
    Ok(offset)
}
