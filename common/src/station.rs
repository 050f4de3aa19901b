use chrono::NaiveDateTime;
use log::{info, warn};

use crate::{
    error::{ConfigError, RecordError, StoreError, TimeError},
    persist::{DurableAcrossPower, DurableStore, KeyValueStore, LogStore},
    recording::{self, TemperatureSensor},
    sleep::{RecordInterval, SleepRequest},
    time::{format_timestamp, parse_phone_time, WallClock},
    types::{Reading, SensorIdentity, StationStatus, NO_DATA, NO_GPS},
};

/// Raw log bytes plus the name a download should be saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Everything one boot of the logger works with.
pub struct Station<K, L, S, C> {
    store: DurableStore<K, L>,
    sensor: S,
    clock: C,
    interval: RecordInterval,
    identity: Option<SensorIdentity>,
}

impl<K, L, S, C> Station<K, L, S, C>
where
    K: KeyValueStore,
    L: LogStore,
    S: TemperatureSensor,
    C: WallClock,
{
    /// Builds the station for this boot, re-reading the persisted interval.
    pub fn new(
        mut store: DurableStore<K, L>,
        sensor: S,
        clock: C,
        default_interval: RecordInterval,
    ) -> Self {
        let interval = match store.interval_minutes(default_interval.minutes()).load() {
            Ok(minutes) => RecordInterval::from_minutes(i64::from(minutes)).unwrap_or_else(|err| {
                warn!("ignoring stored interval: {err}");
                default_interval
            }),
            Err(err) => {
                warn!("failed to load record interval: {err}");
                default_interval
            }
        };

        Self {
            store,
            sensor,
            clock,
            interval,
            identity: None,
        }
    }

    /// Derives the sensor identity. Done once per interactive session.
    pub fn identify(&mut self) -> SensorIdentity {
        let identity = self.sensor.identity();
        info!("sensor id: {identity}");
        self.identity = Some(identity.clone());
        identity
    }

    pub fn identity(&self) -> SensorIdentity {
        self.identity.clone().unwrap_or(SensorIdentity::Unknown)
    }

    pub fn interval(&self) -> RecordInterval {
        self.interval
    }

    pub fn set_interval(&mut self, minutes: i64) -> Result<RecordInterval, ConfigError> {
        let interval = RecordInterval::from_minutes(minutes)?;
        self.interval = interval;

        if let Err(err) = self
            .store
            .interval_minutes(interval.minutes())
            .save(&interval.minutes())
        {
            warn!("record interval not persisted: {err}");
        }

        info!("record interval set to {} minute(s)", interval.minutes());
        Ok(interval)
    }

    pub fn record(&mut self) -> Result<Reading, RecordError> {
        recording::record(&mut self.store, &mut self.sensor, &self.clock)
    }

    /// The scheduled-wake path: one recording attempt, then the sleep
    /// request. A failed recording still sleeps.
    pub fn record_and_suspend(&mut self) -> SleepRequest {
        let _ = self.record();
        let request = SleepRequest::for_interval(self.interval);
        info!(
            "going to sleep for {} minute(s)",
            self.interval.minutes()
        );
        request
    }

    pub fn set_time(&mut self, time: &str, offset_minutes: i64) -> Result<NaiveDateTime, TimeError> {
        let local = parse_phone_time(time, offset_minutes)?;
        self.clock.set(local)?;
        info!("wall clock set to {local} (offset {offset_minutes} minutes)");
        Ok(local)
    }

    /// Resets the counter and last reading and deletes the log.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.store.counter().save(&0)?;
        self.store.last_reading().save(&NO_DATA.to_string())?;
        self.store.log_mut().remove()?;
        info!("stored measurements cleared");
        Ok(())
    }

    pub fn set_gps(&mut self, gps: &str) -> Result<(), StoreError> {
        self.store.gps().save(&gps.trim().to_string())
    }

    pub fn gps(&mut self) -> String {
        self.store.gps().load().unwrap_or_else(|err| {
            warn!("failed to load gps annotation: {err}");
            NO_GPS.to_string()
        })
    }

    pub fn download(&self) -> Result<Download, StoreError> {
        let bytes = self.store.log().read_all()?;
        Ok(Download {
            filename: self.identity().download_filename(),
            bytes,
        })
    }

    pub fn status(&mut self) -> StationStatus {
        let measurement_count = self.store.counter().load().unwrap_or_else(|err| {
            warn!("failed to load measurement counter: {err}");
            0
        });
        let last_reading = self.store.last_reading().load().unwrap_or_else(|err| {
            warn!("failed to load last reading: {err}");
            NO_DATA.to_string()
        });

        StationStatus {
            sensor_id: self.identity().to_string(),
            interval_minutes: self.interval.minutes(),
            gps: self.gps(),
            measurement_count,
            last_reading,
            clock: format_timestamp(self.clock.now()),
        }
    }

    pub fn store(&self) -> &DurableStore<K, L> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut DurableStore<K, L> {
        &mut self.store
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::fixtures::station;
    use super::*;
    use crate::{
        memory::{MemoryKv, MemoryLog},
        recording::fakes::{FixedClock, ScriptedSensor},
    };

    #[test]
    fn interval_updates_are_validated() {
        let mut station = station(&[]);

        assert_eq!(station.set_interval(0), Err(ConfigError::IntervalTooSmall(0)));
        assert_eq!(station.interval().minutes(), 2);

        assert_eq!(station.set_interval(7).unwrap().minutes(), 7);
        assert_eq!(station.interval().minutes(), 7);

        assert_eq!(
            station.set_interval(-1),
            Err(ConfigError::IntervalTooSmall(-1))
        );
        assert_eq!(station.interval().minutes(), 7);
    }

    #[test]
    fn interval_survives_a_new_boot() {
        let mut station = station(&[]);
        station.set_interval(30).unwrap();

        let Station { store, .. } = station;
        let rebooted = Station::new(
            store,
            ScriptedSensor::default(),
            FixedClock::at(0, 0),
            RecordInterval::default(),
        );

        assert_eq!(rebooted.interval().minutes(), 30);
    }

    #[test]
    fn oversized_interval_is_rejected_and_not_stored() {
        let mut station = station(&[]);

        assert_eq!(
            station.set_interval(99_999_999),
            Err(ConfigError::IntervalTooLarge(99_999_999))
        );
        assert_eq!(station.interval().minutes(), 2);
        assert_eq!(station.store_mut().interval_minutes(0).load(), Ok(0));
    }

    #[test]
    fn stored_interval_out_of_range_falls_back_to_default() {
        let mut store = DurableStore::new(MemoryKv::default(), MemoryLog::default());
        store.interval_minutes(2).save(&99_999_999).unwrap();

        let rebooted = Station::new(
            store,
            ScriptedSensor::default(),
            FixedClock::at(0, 0),
            RecordInterval::default(),
        );

        assert_eq!(rebooted.interval().minutes(), 2);
    }

    #[test]
    fn clear_resets_counter_reading_and_log() {
        let mut station = station(&[]);
        {
            let store = station.store_mut();
            store.counter().save(&17).unwrap();
            store
                .last_reading()
                .save(&"20240101 10:00;21.5".to_string())
                .unwrap();
            for minute in 0..17 {
                store
                    .log_mut()
                    .append(&format!("20240101 09:{minute:02};21.5\n"))
                    .unwrap();
            }
        }
        assert_eq!(station.store().log().line_count(), 17);

        station.clear().unwrap();

        let store = station.store_mut();
        assert_eq!(store.counter().load(), Ok(0));
        assert_eq!(store.log().read_all(), Err(StoreError::NotFound));
        assert_eq!(
            store.last_reading().load(),
            Ok("No data recorded yet.".to_string())
        );
    }

    #[test]
    fn clear_keeps_gps_annotation() {
        let mut station = station(&[]);
        station.set_gps(" 43.6, 1.44 ").unwrap();

        station.clear().unwrap();

        assert_eq!(station.gps(), "43.6, 1.44");
    }

    #[test]
    fn download_is_the_appended_entries_in_order() {
        let mut station = station(&[18.0, 18.5, 19.0]);
        station.identify();

        let mut expected = Vec::new();
        for _ in 0..3 {
            let reading = station.record().unwrap();
            expected.extend_from_slice(reading.log_line().as_bytes());
        }

        let download = station.download().unwrap();
        assert_eq!(download.bytes, expected);
        assert_eq!(download.filename, "28:aa:1:2:3:4:5:6_data.txt");
    }

    #[test]
    fn download_without_log_is_not_found() {
        let station = station(&[]);
        assert_eq!(station.download(), Err(StoreError::NotFound));
    }

    #[test]
    fn record_and_suspend_sleeps_even_when_sensor_fails() {
        let mut station = station(&[]);
        station.set_interval(5).unwrap();

        let request = station.record_and_suspend();

        assert_eq!(request.duration(), Duration::from_secs(300));
        assert_eq!(station.sensor().reads, 1);
        assert_eq!(station.store_mut().counter().load(), Ok(0));
    }

    #[test]
    fn set_time_moves_the_wall_clock() {
        let mut station = station(&[23.0]);

        let local = station.set_time("2024-06-01T12:00:00.000Z", -120).unwrap();
        let reading = station.record().unwrap();

        assert_eq!(local, reading.taken_at);
        assert_eq!(reading.entry(), "20240601 14:00;23.00");
    }

    #[test]
    fn set_time_rejects_bad_input_without_touching_clock() {
        let mut station = station(&[]);

        assert!(station.set_time("not-a-time", 0).is_err());
        assert_eq!(station.status().clock, "20240101 10:00");
    }

    #[test]
    fn status_reflects_store() {
        let mut station = Station::new(
            DurableStore::new(MemoryKv::default(), MemoryLog::default()),
            ScriptedSensor::with_values(&[21.0]),
            FixedClock::at(6, 45),
            RecordInterval::from_minutes(10).unwrap(),
        );
        station.identify();
        station.record().unwrap();

        let status = station.status();

        assert_eq!(status.sensor_id, "28:aa:1:2:3:4:5:6");
        assert_eq!(status.interval_minutes, 10);
        assert_eq!(status.measurement_count, 1);
        assert_eq!(status.last_reading, "20240101 06:45;21.00");
        assert_eq!(status.gps, NO_GPS);
    }
}
