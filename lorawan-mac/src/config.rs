//! Runtime, board-specific tuning the scheduler needs but which this crate has no way to derive
//! on its own: host tick rate, crystal tolerance, and the handful of guard margins the original
//! stack hardcodes per board in `ldl_mac.h` (`STARTUP_DELAY`, `XTAL_DELAY`, `RX_GUARD`). Exposed as
//! a runtime-validated struct rather than the teacher's const-generic `Timings` trait, since
//! `Mac` is not const-generic over a board type; [`crate::radio::Radio::get_xtal_delay_ms`] still
//! carries the one per-board figure that is purely a radio-chip property.

/// Errors a [`Config`] fails validation with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ConfigError {
    /// `tps` (host ticks per second) must be nonzero -- it is a divisor throughout the scheduler.
    ZeroTickRate,
    /// `max_power_deci_dbm` must be positive; a device with no usable transmit power cannot join.
    NonPositiveMaxPower,
}

/// Board/timing parameters the scheduler is generic over via a plain value rather than a type
/// parameter. Validated once at construction so every later use can assume sane values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Host clock rate in ticks per second, used to convert every other field (and every airtime
    /// figure) into ticks.
    pub tps: u32,
    /// First coefficient of the crystal-drift model `error = waitSeconds*a*2 + b`
    /// (`LDL_Radio_getXTALError`-equivalent): scales with how long it has been since the radio
    /// last had a timing reference (the end of TX), in ticks per second of wait.
    pub xtal_error_a: u32,
    /// Second coefficient of the same model: a fixed tick offset independent of wait time,
    /// covering the radio's own wake-up jitter.
    pub xtal_error_b: u32,
    /// How many ticks before a nominal RX-window open time the radio is told to start receiving,
    /// covering its own wake-from-standby settle time on top of [`crate::radio::Radio::get_xtal_delay_ms`].
    pub rx_window_advance_ticks: u32,
    /// Ticks to hold the radio in `Reset` and then `Boot` before the scheduler considers it ready,
    /// matching the original stack's `LDL_Radio_reset` hold time.
    pub startup_delay_ticks: u32,
    /// Upper bound (in ticks) of the random dither added before the first OTAA join transmission,
    /// spreading join attempts across a population of devices power-cycled simultaneously.
    pub otaa_dither_ticks: u32,
    /// Brief guard held after an RX2 miss before the scheduler will consider another transmission,
    /// preventing a tight retry loop from starving the duty-cycle/ADR backoff it just incurred.
    pub rx2_lockout_ticks: u32,
    /// Maximum EIRP the board's power amplifier and antenna combination can produce, in deci-dBm
    /// (tenths of a dBm, matching [`crate::region::tx_power_deci_dbm`]'s scale). Clamps every
    /// region TX-power table lookup.
    pub max_power_deci_dbm: i16,
    /// Antenna gain in dBi, subtracted from conducted power to report EIRP where a region's rules
    /// are EIRP-based (all four regions implemented here are).
    pub antenna_gain_dbi: i16,
}

impl Config {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.tps == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.max_power_deci_dbm <= 0 {
            return Err(ConfigError::NonPositiveMaxPower);
        }
        Ok(self)
    }
}

impl Default for Config {
    /// Conservative defaults matching the original stack's reference board: a 32768 Hz tick
    /// source (common on MCUs with an RTC crystal), +/-20ppm crystal tolerance, and a 14 dBm PA.
    fn default() -> Self {
        Self {
            tps: 32_768,
            xtal_error_a: 0,
            xtal_error_b: 32_768 / 1000, // 1ms of pure radio wake-up jitter
            rx_window_advance_ticks: 32_768 / 200, // 5ms
            startup_delay_ticks: 32_768 / 100,     // 10ms
            otaa_dither_ticks: 32_768,             // up to 1s
            rx2_lockout_ticks: 32_768 / 20,        // 50ms
            max_power_deci_dbm: 160,               // 16 dBm, the EU868 ceiling
            antenna_gain_dbi: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tick_rate_is_rejected() {
        let cfg = Config { tps: 0, ..Config::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroTickRate));
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }
}
