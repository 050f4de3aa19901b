use serde::{Deserialize, Serialize};

use crate::sleep::RecordInterval;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "ESP32_Temperature_AP".to_string(),
            password: "12345678".to_string(),
            channel: 1,
        }
    }
}

impl AccessPointConfig {
    pub fn sanitize(&mut self) {
        if self.ssid.trim().is_empty() {
            self.ssid = Self::default().ssid;
        }

        // WPA2 needs 8..=63 characters; anything else falls back to the default.
        if !(8..=63).contains(&self.password.len()) {
            self.password = Self::default().password;
        }

        if !(1..=13).contains(&self.channel) {
            self.channel = 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    pub one_wire_pin: i32,
    pub wake_pin: i32,
    pub http_port: u16,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            one_wire_pin: 4,
            wake_pin: 10,
            http_port: 80,
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        if self.one_wire_pin < 0 {
            self.one_wire_pin = 4;
        }

        if self.wake_pin < 0 {
            self.wake_pin = 10;
        }

        if self.http_port == 0 {
            self.http_port = 80;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggerConfig {
    pub interactive_record_period_ms: u64,
    pub default_interval_minutes: u32,
    pub access_point: AccessPointConfig,
    pub hardware: HardwareConfig,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            interactive_record_period_ms: 10_000,
            default_interval_minutes: 2,
            access_point: AccessPointConfig::default(),
            hardware: HardwareConfig::default(),
        }
    }
}

impl LoggerConfig {
    pub fn sanitize(&mut self) {
        self.interactive_record_period_ms = self.interactive_record_period_ms.max(1_000);
        self.default_interval_minutes = self
            .default_interval_minutes
            .clamp(RecordInterval::MIN_MINUTES, RecordInterval::MAX_MINUTES);
        self.access_point.sanitize();
        self.hardware.sanitize();
    }

    pub fn default_interval(&self) -> RecordInterval {
        RecordInterval::from_minutes(i64::from(self.default_interval_minutes)).unwrap_or_default()
    }

    /// Parses a stored JSON document, filling gaps with defaults.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.sanitize();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_field_firmware() {
        let config = LoggerConfig::default();

        assert_eq!(config.interactive_record_period_ms, 10_000);
        assert_eq!(config.default_interval().minutes(), 2);
        assert_eq!(config.access_point.ssid, "ESP32_Temperature_AP");
        assert_eq!(config.hardware.one_wire_pin, 4);
        assert_eq!(config.hardware.wake_pin, 10);
    }

    #[test]
    fn sanitize_repairs_out_of_range_values() {
        let mut config = LoggerConfig {
            interactive_record_period_ms: 0,
            default_interval_minutes: 0,
            access_point: AccessPointConfig {
                ssid: " ".into(),
                password: "short".into(),
                channel: 40,
            },
            hardware: HardwareConfig {
                one_wire_pin: -1,
                wake_pin: -3,
                http_port: 0,
            },
        };

        config.sanitize();

        assert_eq!(config.interactive_record_period_ms, 1_000);
        assert_eq!(config.default_interval_minutes, 1);
        assert_eq!(config.access_point, AccessPointConfig::default());
        assert_eq!(config.hardware, HardwareConfig::default());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = LoggerConfig::from_json(
            r#"{"interactive_record_period_ms":5000,"default_interval_minutes":15}"#,
        )
        .unwrap();

        assert_eq!(config.interactive_record_period_ms, 5_000);
        assert_eq!(config.default_interval().minutes(), 15);
        assert_eq!(config.hardware, HardwareConfig::default());
    }

    #[test]
    fn access_point_alone_keeps_other_defaults() {
        let config = LoggerConfig::from_json(
            r#"{"access_point":{"ssid":"Lab","password":"secretpass","channel":6}}"#,
        )
        .unwrap();

        assert_eq!(config.access_point.ssid, "Lab");
        assert_eq!(config.access_point.password, "secretpass");
        assert_eq!(config.access_point.channel, 6);
        assert_eq!(config.interactive_record_period_ms, 10_000);
        assert_eq!(config.default_interval_minutes, 2);
        assert_eq!(config.hardware, HardwareConfig::default());
    }

    #[test]
    fn partial_hardware_section_fills_missing_pins() {
        let config = LoggerConfig::from_json(r#"{"hardware":{"wake_pin":2}}"#).unwrap();

        assert_eq!(config.hardware.wake_pin, 2);
        assert_eq!(config.hardware.one_wire_pin, 4);
        assert_eq!(config.hardware.http_port, 80);
        assert_eq!(config.access_point, AccessPointConfig::default());
    }

    #[test]
    fn oversized_default_interval_is_capped() {
        let config = LoggerConfig::from_json(r#"{"default_interval_minutes":99999999}"#).unwrap();

        assert_eq!(
            config.default_interval().minutes(),
            RecordInterval::MAX_MINUTES
        );
    }
}
