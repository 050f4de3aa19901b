use std::fmt::Display;

use log::{info, warn};

use crate::{
    persist::{KeyValueStore, LogStore, VolatileAcrossSleep},
    recording::TemperatureSensor,
    sleep::SleepRequest,
    station::Station,
    time::WallClock,
    types::SensorIdentity,
    wake::{classify, BootMode, WakeCause},
};

/// The local access point and HTTP server an interactive boot exposes.
pub trait ControlSurface {
    type Error: Display;

    fn start(&mut self, identity: &SensorIdentity) -> Result<(), Self::Error>;
}

/// How a boot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// The control surface is up; the caller runs the interactive loop.
    Interactive,
    /// The boot is over. The caller must suspend for the requested time.
    Suspended(SleepRequest),
}

/// Runs one boot from wake classification up to either suspend or the
/// start of the interactive session.
pub fn boot<F, K, L, S, C, U>(
    cause: WakeCause,
    first_boot: &mut F,
    station: &mut Station<K, L, S, C>,
    surface: &mut U,
) -> BootOutcome
where
    F: VolatileAcrossSleep<bool> + ?Sized,
    K: KeyValueStore,
    L: LogStore,
    S: TemperatureSensor,
    C: WallClock,
    U: ControlSurface + ?Sized,
{
    let mode = classify(cause, first_boot);
    info!("wake cause {cause:?}, boot mode {mode:?}");

    match mode {
        BootMode::ScheduledWake => BootOutcome::Suspended(station.record_and_suspend()),
        BootMode::ColdBoot | BootMode::ExternalSignalWake => {
            first_boot.set(false);

            let identity = station.identify();
            if let Err(err) = surface.start(&identity) {
                warn!("control surface failed to start: {err}");
            }

            let _ = station.record();
            BootOutcome::Interactive
        }
    }
}

/// Fires every `period_ms` while the interactive session is running.
#[derive(Debug, Clone, Copy)]
pub struct RecordTicker {
    period_ms: u64,
    last_ms: u64,
}

impl RecordTicker {
    pub fn new(period_ms: u64, now_ms: u64) -> Self {
        Self {
            period_ms,
            last_ms: now_ms,
        }
    }

    pub fn due(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_ms) >= self.period_ms {
            self.last_ms = now_ms;
            return true;
        }
        false
    }
}
