//! The host-system capabilities the scheduler needs beyond the radio: a monotonic tick source is
//! mandatory, entropy and battery reporting are optional conveniences with sane defaults so a
//! minimal host isn't forced to implement them.

/// Host-system services the scheduler reads from on every [`crate::mac::Mac::process`] call.
/// Grounded on the original stack's `ldl_system` function-pointer table (`LDL_SYSTEM_getTime`,
/// `LDL_SYSTEM_rand`, `LDL_SYSTEM_getBatteryLevel`), restyled as a trait with default methods so
/// a host need only implement [`Self::ticks`] to get a working device; this crate deliberately
/// does not depend on `rand_core` for this, since the teacher's own dependency stack doesn't pull
/// it in and a single counter-driven default is enough to dither join attempts.
pub trait Platform {
    /// Monotonic tick count, same units as [`crate::config::Config::tps`]. Must never go backwards;
    /// wraparound is handled (the scheduler only ever compares differences).
    fn ticks(&mut self) -> u32;

    /// A host-supplied random value, used to dither join timing and pick fixed-plan join channels.
    /// The default always returns `0`, which still produces a *valid* (if undithered) schedule.
    fn rand(&mut self) -> u32 {
        0
    }

    /// Battery level for `DevStatusAns`, on the LoRaWAN 0..254 scale (255 means "not measurable").
    /// Defaults to "not measurable".
    fn battery_level(&mut self) -> u8 {
        255
    }
}
