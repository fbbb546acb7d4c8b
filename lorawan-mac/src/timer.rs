//! Logical timers plus the interrupt-safe input latch.
//!
//! The scheduler (`mac.rs`) never reads the platform clock directly once an operation is in
//! flight -- it arms one of these timers with a deadline in host ticks, and `process()` compares
//! the current tick count against every armed deadline. `radio_event` (called from an interrupt
//! context) only ever touches the input latch, guarded by `critical_section`, so it never races
//! the scheduler's own state mutation. Grounded on the original stack's `ldl_mac.c` timer array
//! (`WAIT_A`, `WAIT_B`, one per duty-cycle band) and its `inputArm`/`inputSignal`/`inputCheck`
//! input-latch functions.

use critical_section::Mutex;
use core::cell::Cell;

/// Identifies one of the scheduler's logical timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum TimerId {
    /// RX1-window / next-retry / guard timer.
    WaitA,
    /// RX2-window timer.
    WaitB,
    /// Per-band duty-cycle off-time countdown; indexed 0..N by region band table.
    Band(u8),
}

const MAX_BAND_TIMERS: usize = 6;

#[derive(Clone, Copy, Default)]
struct Deadline {
    armed: bool,
    ticks: u32,
}

/// A fixed-size array of logical timers, each either disarmed or holding an absolute deadline in
/// host ticks.
pub struct Timers {
    wait_a: Deadline,
    wait_b: Deadline,
    bands: [Deadline; MAX_BAND_TIMERS],
}

impl Timers {
    pub const fn new() -> Self {
        Self {
            wait_a: Deadline { armed: false, ticks: 0 },
            wait_b: Deadline { armed: false, ticks: 0 },
            bands: [Deadline { armed: false, ticks: 0 }; MAX_BAND_TIMERS],
        }
    }

    fn slot(&mut self, id: TimerId) -> Option<&mut Deadline> {
        match id {
            TimerId::WaitA => Some(&mut self.wait_a),
            TimerId::WaitB => Some(&mut self.wait_b),
            TimerId::Band(i) => self.bands.get_mut(i as usize),
        }
    }

    pub fn arm(&mut self, id: TimerId, deadline_ticks: u32) {
        if let Some(slot) = self.slot(id) {
            slot.armed = true;
            slot.ticks = deadline_ticks;
        }
    }

    pub fn disarm(&mut self, id: TimerId) {
        if let Some(slot) = self.slot(id) {
            slot.armed = false;
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        match id {
            TimerId::WaitA => self.wait_a.armed,
            TimerId::WaitB => self.wait_b.armed,
            TimerId::Band(i) => self.bands.get(i as usize).is_some_and(|d| d.armed),
        }
    }

    /// True once `now_ticks` has reached or passed the timer's deadline (wrapping-aware: a
    /// deadline that lies "behind" `now` by less than half the tick space is considered expired,
    /// never one that lies far in the future due to wraparound).
    pub fn has_expired(&self, id: TimerId, now_ticks: u32) -> bool {
        match id {
            TimerId::WaitA => self.wait_a.armed && now_ticks.wrapping_sub(self.wait_a.ticks) < (u32::MAX / 2),
            TimerId::WaitB => self.wait_b.armed && now_ticks.wrapping_sub(self.wait_b.ticks) < (u32::MAX / 2),
            TimerId::Band(i) => self
                .bands
                .get(i as usize)
                .is_some_and(|d| d.armed && now_ticks.wrapping_sub(d.ticks) < (u32::MAX / 2)),
        }
    }

    /// Ticks remaining until the earliest armed timer expires (`0` if any has already expired),
    /// or `None` if nothing is armed -- lets a host sleep until the next deadline.
    pub fn ticks_until_next(&self, now_ticks: u32) -> Option<u32> {
        let mut min: Option<u32> = None;
        let mut consider = |d: &Deadline| {
            if d.armed {
                let remaining = d.ticks.wrapping_sub(now_ticks);
                let remaining = if remaining > (u32::MAX / 2) { 0 } else { remaining };
                min = Some(min.map_or(remaining, |m: u32| m.min(remaining)));
            }
        };
        consider(&self.wait_a);
        consider(&self.wait_b);
        for b in &self.bands {
            consider(b);
        }
        min
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt-safe latch for a single radio-interrupt timestamp. `arm` enables it (call before
/// `transmit`/`receive` so an immediate interrupt can never be lost); `signal` (called from
/// `radio_event`) records the timestamp only if armed and not already latched, so the first
/// interrupt wins; `check` reads and disarms it.
pub struct InputLatch {
    armed: Mutex<Cell<bool>>,
    latched: Mutex<Cell<Option<u32>>>,
}

impl InputLatch {
    pub const fn new() -> Self {
        Self { armed: Mutex::new(Cell::new(false)), latched: Mutex::new(Cell::new(None)) }
    }

    pub fn arm(&self) {
        critical_section::with(|cs| {
            self.armed.borrow(cs).set(true);
            self.latched.borrow(cs).set(None);
        });
    }

    pub fn disarm(&self) {
        critical_section::with(|cs| {
            self.armed.borrow(cs).set(false);
            self.latched.borrow(cs).set(None);
        });
    }

    /// Called from interrupt context. Latches `ticks` only if armed and not already latched.
    pub fn signal(&self, ticks: u32) {
        critical_section::with(|cs| {
            if self.armed.borrow(cs).get() && self.latched.borrow(cs).get().is_none() {
                self.latched.borrow(cs).set(Some(ticks));
            }
        });
    }

    /// Returns the latched timestamp (if any) and disarms the latch.
    pub fn check(&self) -> Option<u32> {
        critical_section::with(|cs| {
            let value = self.latched.borrow(cs).get();
            if value.is_some() {
                self.armed.borrow(cs).set(false);
                self.latched.borrow(cs).set(None);
            }
            value
        })
    }

    pub fn pending(&self) -> bool {
        critical_section::with(|cs| self.latched.borrow(cs).get().is_some())
    }
}

impl Default for InputLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_expires_only_after_deadline() {
        let mut t = Timers::new();
        t.arm(TimerId::WaitA, 1000);
        assert!(!t.has_expired(TimerId::WaitA, 999));
        assert!(t.has_expired(TimerId::WaitA, 1000));
        assert!(t.has_expired(TimerId::WaitA, 1001));
    }

    #[test]
    fn ticks_until_next_picks_the_soonest() {
        let mut t = Timers::new();
        t.arm(TimerId::WaitA, 500);
        t.arm(TimerId::WaitB, 200);
        assert_eq!(t.ticks_until_next(100), Some(100));
    }

    #[test]
    fn disarmed_timer_never_expires() {
        let t = Timers::new();
        assert!(!t.has_expired(TimerId::WaitA, u32::MAX));
    }

    #[test]
    fn input_latch_first_interrupt_wins() {
        let latch = InputLatch::new();
        latch.arm();
        latch.signal(42);
        latch.signal(99);
        assert_eq!(latch.check(), Some(42));
        assert_eq!(latch.check(), None);
    }

    #[test]
    fn input_latch_ignores_signal_when_disarmed() {
        let latch = InputLatch::new();
        latch.signal(42);
        assert_eq!(latch.check(), None);
    }
}
