use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("temperature sensor disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    OpenFailed(String),
    #[error("durable store write failed: {0}")]
    WriteFailed(String),
    #[error("log file not found")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("interval must be at least 1 minute (got {0})")]
    IntervalTooSmall(i64),
    #[error("interval must be at most one week (got {0} minutes)")]
    IntervalTooLarge(i64),
    #[error("interval `{0}` is not a valid number of minutes")]
    InvalidInterval(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("wall clock rejected update: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("failed to parse phone time `{0}`")]
    Unparseable(String),
    #[error("invalid timezone offset `{0}`")]
    InvalidOffset(String),
    #[error("time adjustment out of range")]
    OutOfRange,
    #[error(transparent)]
    Clock(#[from] ClockError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
