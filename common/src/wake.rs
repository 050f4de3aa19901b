use crate::persist::VolatileAcrossSleep;

/// Why the chip resumed execution, as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    PowerOn,
    Timer,
    ExternalSignal,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    ColdBoot,
    ScheduledWake,
    ExternalSignalWake,
}

impl BootMode {
    /// Whether this boot runs the interactive branch.
    pub fn is_interactive(self) -> bool {
        !matches!(self, Self::ScheduledWake)
    }
}

/// Derives the boot mode from the wake cause and the first-boot flag.
///
/// An external-signal wake forces the flag back to `true` so the session
/// behaves like a fresh power-up. Causes we do not recognise degrade to a
/// cold boot.
pub fn classify<F>(cause: WakeCause, first_boot: &mut F) -> BootMode
where
    F: VolatileAcrossSleep<bool> + ?Sized,
{
    match cause {
        WakeCause::ExternalSignal => {
            first_boot.set(true);
            BootMode::ExternalSignalWake
        }
        WakeCause::PowerOn | WakeCause::Timer => {
            if first_boot.get() {
                BootMode::ColdBoot
            } else {
                BootMode::ScheduledWake
            }
        }
        WakeCause::Other(_) => BootMode::ColdBoot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RetainedCell;

    #[test]
    fn external_signal_always_interactive() {
        for prior in [true, false] {
            let mut flag = RetainedCell::power_on(prior);
            let mode = classify(WakeCause::ExternalSignal, &mut flag);

            assert_eq!(mode, BootMode::ExternalSignalWake);
            assert!(mode.is_interactive());
            assert!(flag.get());
        }
    }

    #[test]
    fn timer_wake_follows_flag() {
        let mut flag = RetainedCell::power_on(false);
        assert_eq!(
            classify(WakeCause::Timer, &mut flag),
            BootMode::ScheduledWake
        );

        let mut flag = RetainedCell::power_on(true);
        assert_eq!(classify(WakeCause::Timer, &mut flag), BootMode::ColdBoot);
    }

    #[test]
    fn power_on_is_cold() {
        let mut flag = RetainedCell::power_on(true);
        assert_eq!(classify(WakeCause::PowerOn, &mut flag), BootMode::ColdBoot);
    }

    #[test]
    fn unknown_cause_degrades_to_cold_boot() {
        let mut flag = RetainedCell::power_on(false);
        let mode = classify(WakeCause::Other(9), &mut flag);

        assert_eq!(mode, BootMode::ColdBoot);
        assert!(mode.is_interactive());
    }
}
