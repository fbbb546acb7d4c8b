//! Duty-cycle accounting in fixed-point "time units" (1 second = 256 units), matching the
//! original stack's internal tick-to-airtime math closely enough to be cheap on a microcontroller
//! while avoiding the rounding drift plain integer-millisecond airtime would accumulate over a
//! long-running device.
//!
//! Grounded on `ldl_mac.c`'s band bookkeeping (`registerUplink`, `rationalizeTime`/off-time
//! decrement on every `process()` call) and the region table's per-band `offTimeFactor`.

pub const TIME_UNITS_PER_SECOND: u32 = 256;

/// Pure tick-to-time-unit conversion for a one-off duration (an airtime figure), as opposed to
/// [`DutyCycle::ticks_to_units`]'s remainder-carrying conversion of a stream of elapsed-time
/// deltas. A single rounding error on one frame's airtime is immaterial next to the off-time it
/// produces, so this deliberately doesn't bother carrying a remainder.
pub fn ticks_to_time_units(ticks: u32, tps: u32) -> u32 {
    ((ticks as u64) * (TIME_UNITS_PER_SECOND as u64) / tps.max(1) as u64) as u32
}

/// Index of the global (aggregated) duty-cycle counter within a [`DutyCycle`]'s band array --
/// every region's band table additionally maintains this one on top of its per-sub-band counters.
pub const GLOBAL_BAND: usize = 0;

pub const MAX_BANDS: usize = 8;

/// How aggressively OTAA join attempts back off the global counter, scaled by how long the
/// device has been trying to join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinBackoffTier {
    /// First hour after the first attempt: 100x.
    FirstHour,
    /// Hours 1 through 10: 1000x.
    FirstDay,
    /// Beyond 10 hours: 10000x.
    Thereafter,
}

impl JoinBackoffTier {
    pub fn factor(self) -> u32 {
        match self {
            JoinBackoffTier::FirstHour => 100,
            JoinBackoffTier::FirstDay => 1_000,
            JoinBackoffTier::Thereafter => 10_000,
        }
    }

    pub fn for_elapsed_seconds(elapsed_s: u32) -> Self {
        if elapsed_s < 3_600 {
            JoinBackoffTier::FirstHour
        } else if elapsed_s < 11 * 3_600 {
            JoinBackoffTier::FirstDay
        } else {
            JoinBackoffTier::Thereafter
        }
    }
}

/// Per-region, per-band and global duty-cycle counters, all in time units.
pub struct DutyCycle {
    bands: [u32; MAX_BANDS],
    band_count: usize,
    sub_tick_remainder: u32,
    tps: u32,
}

impl DutyCycle {
    /// `tps` is the host tick rate (ticks per second); `band_count` includes the global band at
    /// index [`GLOBAL_BAND`].
    pub fn new(tps: u32, band_count: usize) -> Self {
        Self { bands: [0; MAX_BANDS], band_count: band_count.min(MAX_BANDS), sub_tick_remainder: 0, tps }
    }

    pub fn band_off_time(&self, band: usize) -> u32 {
        self.bands.get(band).copied().unwrap_or(0)
    }

    pub fn band_ready(&self, band: usize) -> bool {
        self.band_off_time(band) == 0
    }

    pub fn global_ready(&self) -> bool {
        self.band_ready(GLOBAL_BAND)
    }

    /// Converts a duration in host ticks into time units (1 s = 256 units) without losing
    /// fractional ticks across repeated calls.
    pub fn ticks_to_units(&mut self, ticks: u32) -> u32 {
        let scaled = (ticks as u64) * (TIME_UNITS_PER_SECOND as u64) + self.sub_tick_remainder as u64;
        let units = scaled / self.tps as u64;
        self.sub_tick_remainder = (scaled % self.tps as u64) as u32;
        units as u32
    }

    /// Registers a completed transmission's airtime (in time units) against the band the
    /// transmitting channel belongs to, and -- if an aggregated max-duty-cycle is active, or the
    /// device is mid-OTAA -- against the global counter too.
    pub fn register_time(
        &mut self,
        band: usize,
        air_time_units: u32,
        off_time_factor: u32,
        max_duty_cycle_exp: Option<u8>,
        otaa_tier: Option<JoinBackoffTier>,
    ) {
        if let Some(slot) = self.bands.get_mut(band) {
            *slot = slot.saturating_add(air_time_units.saturating_mul(off_time_factor));
        }

        let mut global_factor: u32 = 0;
        if let Some(exp) = max_duty_cycle_exp {
            global_factor = global_factor.max(1u32 << exp);
        }
        if let Some(tier) = otaa_tier {
            global_factor = global_factor.max(tier.factor());
        }

        if global_factor > 0 {
            self.bands[GLOBAL_BAND] =
                self.bands[GLOBAL_BAND].saturating_add(air_time_units.saturating_mul(global_factor));
        }
    }

    /// Subtracts `elapsed_units` from every non-zero counter, returning `true` if any previously
    /// nonzero band (and the global counter) just reached zero -- the scheduler's cue to raise
    /// `ChannelReady`.
    pub fn process(&mut self, elapsed_units: u32) -> bool {
        let mut became_ready = false;
        for i in 0..self.band_count {
            let before = self.bands[i];
            if before > 0 {
                self.bands[i] = before.saturating_sub(elapsed_units);
                if self.bands[i] == 0 {
                    became_ready = true;
                }
            }
        }
        became_ready && self.global_ready()
    }

    /// Directly sets a band's off-time counter, used once at startup to seed the global counter
    /// with the configured startup delay (not itself the product of a registered transmission).
    pub fn set_band(&mut self, band: usize, units: u32) {
        if let Some(slot) = self.bands.get_mut(band) {
            *slot = units;
        }
    }

    pub fn can_transmit(&self, band: usize) -> bool {
        self.band_ready(band) && self.global_ready()
    }

    /// Host ticks until `band` (and the global counter, whichever is later) next reaches zero --
    /// the inverse of [`Self::ticks_to_units`], used by the scheduler to size its sleep budget
    /// rather than busy-poll a duty-cycle-blocked channel.
    pub fn ticks_until_ready(&self, band: usize) -> u32 {
        let units = self.band_off_time(band).max(self.band_off_time(GLOBAL_BAND));
        ((units as u64 * self.tps as u64).div_ceil(TIME_UNITS_PER_SECOND as u64)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_process_reaches_zero() {
        let mut dc = DutyCycle::new(1000, 2);
        dc.register_time(1, 256, 99, None, None); // 100x factor -> 25600 units off-time
        assert!(!dc.band_ready(1));
        dc.process(25_600);
        assert!(dc.band_ready(1));
    }

    #[test]
    fn otaa_backoff_scales_with_elapsed_time() {
        assert_eq!(JoinBackoffTier::for_elapsed_seconds(0).factor(), 100);
        assert_eq!(JoinBackoffTier::for_elapsed_seconds(3_600).factor(), 1_000);
        assert_eq!(JoinBackoffTier::for_elapsed_seconds(11 * 3_600).factor(), 10_000);
    }

    #[test]
    fn global_band_gates_every_other_band() {
        let mut dc = DutyCycle::new(1000, 2);
        dc.bands[GLOBAL_BAND] = 10;
        assert!(!dc.can_transmit(1));
    }

    #[test]
    fn ticks_until_ready_inverts_ticks_to_units() {
        let mut dc = DutyCycle::new(1000, 2);
        dc.register_time(1, 256, 99, None, None); // 25600 units off-time == 100s == 100_000 ticks @1000tps
        assert_eq!(dc.ticks_until_ready(1), 100_000);
    }

    #[test]
    fn ticks_to_units_accumulates_sub_tick_remainder() {
        let mut dc = DutyCycle::new(3, 1);
        // 1 tick at 3 ticks/sec should be 256/3 = 85.33 units; across 3 calls we should see the
        // remainder carry so the total matches 3 ticks exactly (256 units).
        let total: u32 = (0..3).map(|_| dc.ticks_to_units(1)).sum();
        assert_eq!(total, 256);
    }
}
