use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::time::format_timestamp;

/// Shown for the last-reading slot before the first recording and after a clear.
pub const NO_DATA: &str = "No data recorded yet.";
pub const NO_GPS: &str = "No GPS coordinates set.";

/// Label derived from the sensor's ROM address once per cold boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorIdentity {
    Address([u8; 8]),
    Unknown,
    NotFound,
}

impl SensorIdentity {
    pub fn download_filename(&self) -> String {
        format!("{self}_data.txt")
    }
}

impl fmt::Display for SensorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(bytes) => {
                for (index, byte) in bytes.iter().enumerate() {
                    if index > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{byte:x}")?;
                }
                Ok(())
            }
            Self::Unknown => f.write_str("Unknown_Sensor"),
            Self::NotFound => f.write_str("No_Sensor_Found"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub taken_at: NaiveDateTime,
    pub celsius: f32,
}

impl Reading {
    /// One log entry: `<timestamp>;<value>` without the trailing newline.
    pub fn entry(&self) -> String {
        format!("{};{:.2}", format_timestamp(self.taken_at), self.celsius)
    }

    pub fn log_line(&self) -> String {
        let mut line = self.entry();
        line.push('\n');
        line
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    #[serde(rename = "intervalMinutes")]
    pub interval_minutes: u32,
    pub gps: String,
    #[serde(rename = "measurementCount")]
    pub measurement_count: u32,
    #[serde(rename = "lastReading")]
    pub last_reading: String,
    #[serde(rename = "clock")]
    pub clock: String,
}
