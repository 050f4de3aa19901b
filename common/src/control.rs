//! Transport-independent handling of the control surface requests.
//!
//! Both the axum server on the host and the ESP-IDF server build a
//! [`Command`] from the request, call [`dispatch`], and write back the
//! [`Reply`] as-is.

use log::{info, warn};

use crate::{
    error::{ConfigError, StoreError},
    page::render_index,
    persist::{KeyValueStore, LogStore},
    recording::TemperatureSensor,
    routes::ROUTE_INDEX,
    sleep::{RecordInterval, SleepRequest},
    station::Station,
    time::{parse_offset, WallClock},
};

pub const CONTENT_TEXT: &str = "text/plain";
pub const CONTENT_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_JSON: &str = "application/json";
pub const CONTENT_OCTET: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Index,
    Status,
    SetTime {
        time: Option<String>,
        offset: Option<String>,
    },
    SetGps {
        gps: Option<String>,
    },
    SetInterval {
        interval: Option<String>,
    },
    Clear,
    Download,
    StartMeasurements,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    /// Set when the session must end in a suspend once the reply is sent.
    pub suspend: Option<SleepRequest>,
}

impl Reply {
    fn new(status: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            headers: Vec::new(),
            body: body.into(),
            suspend: None,
        }
    }

    pub fn text(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, CONTENT_TEXT, message.into())
    }

    fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn dispatch<K, L, S, C>(station: &mut Station<K, L, S, C>, command: Command) -> Reply
where
    K: KeyValueStore,
    L: LogStore,
    S: TemperatureSensor,
    C: WallClock,
{
    match command {
        Command::Index => Reply::new(200, CONTENT_HTML, render_index(&station.status())),
        Command::Status => match serde_json::to_vec(&station.status()) {
            Ok(body) => Reply::new(200, CONTENT_JSON, body),
            Err(err) => Reply::text(500, format!("status serialization failed: {err}")),
        },
        Command::SetTime { time, offset } => set_time(station, time, offset),
        Command::SetGps { gps } => set_gps(station, gps),
        Command::SetInterval { interval } => set_interval(station, interval),
        Command::Clear => match station.clear() {
            Ok(()) => Reply::new(303, CONTENT_TEXT, Vec::new())
                .with_header("Location", ROUTE_INDEX.to_string()),
            Err(err) => {
                warn!("failed to clear stored data: {err}");
                Reply::text(500, format!("Failed to clear data: {err}"))
            }
        },
        Command::Download => match station.download() {
            Ok(download) => {
                info!(
                    "sent {} bytes for download as '{}'",
                    download.bytes.len(),
                    download.filename
                );
                Reply::new(200, CONTENT_OCTET, download.bytes)
                    .with_header(
                        "Content-Disposition",
                        format!("attachment; filename=\"{}\"", download.filename),
                    )
                    .with_header("Connection", "close".to_string())
            }
            Err(StoreError::NotFound) => Reply::text(404, "File not found"),
            Err(err) => Reply::text(500, format!("Failed to read data: {err}")),
        },
        Command::StartMeasurements => {
            let request = station.record_and_suspend();
            let mut reply = Reply::text(200, "Measurements started.");
            reply.suspend = Some(request);
            reply
        }
    }
}

fn set_time<K, L, S, C>(
    station: &mut Station<K, L, S, C>,
    time: Option<String>,
    offset: Option<String>,
) -> Reply
where
    K: KeyValueStore,
    L: LogStore,
    S: TemperatureSensor,
    C: WallClock,
{
    let (Some(time), Some(offset)) = (time, offset) else {
        return Reply::text(400, "Missing 'time' or 'offset' parameter");
    };

    let offset = match parse_offset(&offset) {
        Ok(offset) => offset,
        Err(err) => return Reply::text(400, err.to_string()),
    };

    match station.set_time(&time, offset) {
        Ok(_) => Reply::text(
            200,
            format!("Time successfully updated: {time}, Offset: {offset} minutes"),
        ),
        Err(err) => {
            warn!("time update rejected: {err}");
            Reply::text(400, err.to_string())
        }
    }
}

fn set_gps<K, L, S, C>(station: &mut Station<K, L, S, C>, gps: Option<String>) -> Reply
where
    K: KeyValueStore,
    L: LogStore,
    S: TemperatureSensor,
    C: WallClock,
{
    let Some(gps) = gps.filter(|gps| !gps.trim().is_empty()) else {
        return Reply::text(400, "No GPS data received.");
    };

    match station.set_gps(&gps) {
        Ok(()) => Reply::text(200, format!("GPS coordinates saved: {}", gps.trim())),
        Err(err) => {
            warn!("failed to save gps annotation: {err}");
            Reply::text(500, "Failed to save GPS coordinates.")
        }
    }
}

fn set_interval<K, L, S, C>(station: &mut Station<K, L, S, C>, interval: Option<String>) -> Reply
where
    K: KeyValueStore,
    L: LogStore,
    S: TemperatureSensor,
    C: WallClock,
{
    let Some(raw) = interval else {
        return Reply::text(400, "Interval not provided.");
    };

    let result = RecordInterval::parse(&raw)
        .and_then(|interval| station.set_interval(i64::from(interval.minutes())));

    match result {
        Ok(interval) => Reply::text(
            200,
            format!("Interval updated to {} minute(s).", interval.minutes()),
        ),
        Err(ConfigError::IntervalTooSmall(_)) => {
            Reply::text(400, "Invalid interval. Must be at least 1 minute.")
        }
        Err(ConfigError::IntervalTooLarge(_)) => Reply::text(
            400,
            format!(
                "Invalid interval. Must be at most {} minutes.",
                RecordInterval::MAX_MINUTES
            ),
        ),
        Err(err) => Reply::text(400, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{persist::DurableAcrossPower, station::fixtures::station};

    fn header<'a>(reply: &'a Reply, name: &str) -> Option<&'a str> {
        reply
            .headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn download_without_log_is_404() {
        let mut station = station(&[]);

        let reply = dispatch(&mut station, Command::Download);

        assert_eq!(reply.status, 404);
        assert_eq!(reply.body_text(), "File not found");
    }

    #[test]
    fn download_names_file_after_sensor() {
        let mut station = station(&[21.0]);
        station.identify();
        station.record().unwrap();

        let reply = dispatch(&mut station, Command::Download);

        assert_eq!(reply.status, 200);
        assert_eq!(reply.content_type, CONTENT_OCTET);
        assert_eq!(reply.body_text(), "20240101 10:00;21.00\n");
        assert_eq!(
            header(&reply, "Content-Disposition"),
            Some("attachment; filename=\"28:aa:1:2:3:4:5:6_data.txt\"")
        );
    }

    #[test]
    fn clear_redirects_to_index() {
        let mut station = station(&[21.0]);
        station.record().unwrap();

        let reply = dispatch(&mut station, Command::Clear);

        assert_eq!(reply.status, 303);
        assert_eq!(header(&reply, "Location"), Some("/"));
        assert_eq!(station.store_mut().counter().load(), Ok(0));
    }

    #[test]
    fn interval_validation_messages() {
        let mut station = station(&[]);

        let missing = dispatch(&mut station, Command::SetInterval { interval: None });
        assert_eq!(missing.status, 400);
        assert_eq!(missing.body_text(), "Interval not provided.");

        let zero = dispatch(
            &mut station,
            Command::SetInterval {
                interval: Some("0".into()),
            },
        );
        assert_eq!(zero.status, 400);
        assert_eq!(station.interval().minutes(), 2);

        let ok = dispatch(
            &mut station,
            Command::SetInterval {
                interval: Some("5".into()),
            },
        );
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body_text(), "Interval updated to 5 minute(s).");
        assert_eq!(station.interval().minutes(), 5);
    }

    #[test]
    fn interval_beyond_a_week_is_refused() {
        let mut station = station(&[]);

        let reply = dispatch(
            &mut station,
            Command::SetInterval {
                interval: Some("99999999".into()),
            },
        );

        assert_eq!(reply.status, 400);
        assert_eq!(
            reply.body_text(),
            "Invalid interval. Must be at most 10080 minutes."
        );
        assert_eq!(station.interval().minutes(), 2);
    }

    #[test]
    fn failed_clear_reports_error() {
        let mut station = station(&[21.0]);
        station.record().unwrap();
        station.store_mut().log_mut().set_available(false);

        let reply = dispatch(&mut station, Command::Clear);

        assert_eq!(reply.status, 500);
        assert!(reply.body_text().starts_with("Failed to clear data:"));
        assert_eq!(header(&reply, "Location"), None);
    }

    #[test]
    fn set_time_requires_both_fields() {
        let mut station = station(&[]);

        let reply = dispatch(
            &mut station,
            Command::SetTime {
                time: Some("2024-01-01T10:00:00.000Z".into()),
                offset: None,
            },
        );

        assert_eq!(reply.status, 400);
        assert_eq!(reply.body_text(), "Missing 'time' or 'offset' parameter");
    }

    #[test]
    fn set_time_echoes_input() {
        let mut station = station(&[]);

        let reply = dispatch(
            &mut station,
            Command::SetTime {
                time: Some("2024-03-10T08:00:00.000Z".into()),
                offset: Some("-60".into()),
            },
        );

        assert_eq!(reply.status, 200);
        assert_eq!(
            reply.body_text(),
            "Time successfully updated: 2024-03-10T08:00:00.000Z, Offset: -60 minutes"
        );
        assert_eq!(station.status().clock, "20240310 09:00");
    }

    #[test]
    fn gps_is_required() {
        let mut station = station(&[]);

        let empty = dispatch(
            &mut station,
            Command::SetGps {
                gps: Some("  ".into()),
            },
        );
        assert_eq!(empty.status, 400);

        let saved = dispatch(
            &mut station,
            Command::SetGps {
                gps: Some("45.5, -73.6".into()),
            },
        );
        assert_eq!(saved.body_text(), "GPS coordinates saved: 45.5, -73.6");
        assert_eq!(station.gps(), "45.5, -73.6");
    }

    #[test]
    fn start_measurements_records_and_requests_suspend() {
        let mut station = station(&[22.0]);

        let reply = dispatch(&mut station, Command::StartMeasurements);

        assert_eq!(reply.status, 200);
        assert_eq!(
            reply.suspend.map(|request| request.duration()),
            Some(Duration::from_secs(120))
        );
        assert_eq!(station.store_mut().counter().load(), Ok(1));
    }

    #[test]
    fn status_is_json() {
        let mut station = station(&[]);
        station.identify();

        let reply = dispatch(&mut station, Command::Status);
        let value: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();

        assert_eq!(reply.content_type, CONTENT_JSON);
        assert_eq!(value["sensorId"], "28:aa:1:2:3:4:5:6");
        assert_eq!(value["intervalMinutes"], 2);
        assert_eq!(value["lastReading"], "No data recorded yet.");
    }

    #[test]
    fn index_shows_sensor_and_counter() {
        let mut station = station(&[20.0]);
        station.identify();
        station.record().unwrap();

        let reply = dispatch(&mut station, Command::Index);
        let body = reply.body_text();

        assert_eq!(reply.content_type, CONTENT_HTML);
        assert!(body.contains("Sensor ID: 28:aa:1:2:3:4:5:6"));
        assert!(body.contains("Measurement Count: 1"));
        assert!(body.contains("20240101 10:00;20.00"));
    }
}
