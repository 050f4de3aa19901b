//! Form bodies posted by the control page, shared by both HTTP back ends.

use log::warn;
use serde::{de::DeserializeOwned, Deserialize};

use crate::control::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SetTimeForm {
    pub time: Option<String>,
    pub offset: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SetGpsForm {
    pub gps: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SetIntervalForm {
    pub interval: Option<String>,
}

impl From<SetTimeForm> for Command {
    fn from(form: SetTimeForm) -> Self {
        Command::SetTime {
            time: form.time,
            offset: form.offset,
        }
    }
}

impl From<SetGpsForm> for Command {
    fn from(form: SetGpsForm) -> Self {
        Command::SetGps { gps: form.gps }
    }
}

impl From<SetIntervalForm> for Command {
    fn from(form: SetIntervalForm) -> Self {
        Command::SetInterval {
            interval: form.interval,
        }
    }
}

/// Decodes an `application/x-www-form-urlencoded` body. A body that does
/// not decode reads as an empty form, which the handlers answer with their
/// missing-parameter reply.
pub fn decode<T>(body: &[u8]) -> T
where
    T: DeserializeOwned + Default,
{
    serde_urlencoded::from_bytes(body).unwrap_or_else(|err| {
        warn!("ignoring malformed form body: {err}");
        T::default()
    })
}
