pub mod boot;
pub mod config;
pub mod control;
pub mod error;
pub mod form;
pub mod memory;
pub mod page;
pub mod persist;
pub mod recording;
pub mod routes;
pub mod sleep;
pub mod station;
pub mod time;
pub mod types;
pub mod wake;

pub use boot::{boot, BootOutcome, ControlSurface, RecordTicker};
pub use config::{AccessPointConfig, HardwareConfig, LoggerConfig};
pub use control::{dispatch, Command, Reply};
pub use error::{ClockError, ConfigError, RecordError, SensorError, StoreError, TimeError};
pub use persist::{
    Attached, DurableAcrossPower, DurableStore, KeyValueStore, LogStore, VolatileAcrossSleep,
};
pub use recording::TemperatureSensor;
pub use routes::*;
pub use sleep::{RecordInterval, SleepRequest};
pub use station::{Download, Station};
pub use time::WallClock;
pub use types::{Reading, SensorIdentity, StationStatus};
pub use wake::{BootMode, WakeCause};
