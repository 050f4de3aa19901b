use log::{info, warn};

use crate::{
    error::{RecordError, SensorError},
    persist::{DurableAcrossPower, DurableStore, KeyValueStore, LogStore},
    time::WallClock,
    types::{Reading, SensorIdentity},
};

/// Value a DS18B20 driver reports when the probe does not answer.
pub const DISCONNECTED_C: f32 = -127.0;

pub trait TemperatureSensor {
    /// Scans the bus and derives the label used for downloads.
    fn identity(&mut self) -> SensorIdentity;
    fn request_conversion(&mut self) -> Result<(), SensorError>;
    fn read_celsius(&mut self) -> Result<f32, SensorError>;
}

/// Takes one reading and persists it.
///
/// Writes happen in a fixed order: last reading, counter, log append. They
/// are not atomic as a group. A sensor failure performs no writes at all.
pub fn record<K, L, S, C>(
    store: &mut DurableStore<K, L>,
    sensor: &mut S,
    clock: &C,
) -> Result<Reading, RecordError>
where
    K: KeyValueStore,
    L: LogStore,
    S: TemperatureSensor + ?Sized,
    C: WallClock + ?Sized,
{
    let celsius = match acquire(sensor) {
        Ok(celsius) => celsius,
        Err(err) => {
            warn!("could not read temperature data: {err}");
            return Err(err.into());
        }
    };

    let reading = Reading {
        taken_at: clock.now(),
        celsius,
    };

    persist(store, &reading).map_err(|err| {
        warn!("recording aborted: {err}");
        err
    })?;

    info!("temperature recorded: {:.2}°C", reading.celsius);
    if let Some(free) = store.log().free_bytes() {
        info!("free flash: {free} bytes");
    }

    Ok(reading)
}

fn acquire<S: TemperatureSensor + ?Sized>(sensor: &mut S) -> Result<f32, SensorError> {
    sensor.request_conversion()?;
    let celsius = sensor.read_celsius()?;

    if !celsius.is_finite() || celsius == DISCONNECTED_C {
        return Err(SensorError::Disconnected);
    }
    Ok(celsius)
}

fn persist<K: KeyValueStore, L: LogStore>(
    store: &mut DurableStore<K, L>,
    reading: &Reading,
) -> Result<(), RecordError> {
    store.last_reading().save(&reading.entry())?;
    store.increment_counter()?;
    store.log_mut().append(&reading.log_line())?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::collections::VecDeque;

    use chrono::{NaiveDate, NaiveDateTime};

    use super::*;
    use crate::error::ClockError;

    #[derive(Debug, Default)]
    pub struct ScriptedSensor {
        pub values: VecDeque<f32>,
        pub conversions: usize,
        pub reads: usize,
        pub identity_scans: usize,
    }

    impl ScriptedSensor {
        pub fn with_values(values: &[f32]) -> Self {
            Self {
                values: values.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl TemperatureSensor for ScriptedSensor {
        fn identity(&mut self) -> SensorIdentity {
            self.identity_scans += 1;
            SensorIdentity::Address([0x28, 0xaa, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
        }

        fn request_conversion(&mut self) -> Result<(), SensorError> {
            self.conversions += 1;
            Ok(())
        }

        fn read_celsius(&mut self) -> Result<f32, SensorError> {
            self.reads += 1;
            self.values.pop_front().ok_or(SensorError::Disconnected)
        }
    }

    #[derive(Debug, Clone)]
    pub struct FixedClock(pub NaiveDateTime);

    impl FixedClock {
        pub fn at(hour: u32, minute: u32) -> Self {
            Self(
                NaiveDate::from_ymd_opt(2024, 1, 1)
                    .unwrap()
                    .and_hms_opt(hour, minute, 0)
                    .unwrap(),
            )
        }
    }

    impl WallClock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }

        fn set(&mut self, local: NaiveDateTime) -> Result<(), ClockError> {
            self.0 = local;
            Ok(())
        }
    }
}
