//! The `Radio` capability the scheduler drives: mode control, TX/RX, entropy sampling and status
//! polling. Grounded on the original stack's `ldl_radio` interface and the teacher's
//! `lorawan-device/src/radio.rs` `PhyRxTx` trait, but shaped as a synchronous, non-blocking
//! capability (matching this spec's cooperative `process()` model) rather than the teacher's
//! `nb::Result`/async split: every method here either completes immediately (mode changes,
//! starting a TX/RX) or reports status the scheduler polls for on the next `process()` call.

use lora_modulation::{Bandwidth, SpreadingFactor};

/// Power states / activities the scheduler puts the transceiver into. `TxRfo` and `TxBoost`
/// distinguish the SX127x-style RFO and PA_BOOST output paths; a board wires whichever its
/// antenna matching network expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum RadioMode {
    Reset,
    Sleep,
    Standby,
    Rx,
    TxRfo,
    TxBoost,
    Hold,
    Boot,
}

/// Modulation + frequency for a single transmission, already resolved from a region data-rate
/// index by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxSetting {
    pub freq_hz: u32,
    pub sf: SpreadingFactor,
    pub bw: Bandwidth,
    /// Deci-dBm (tenths of a dBm), as produced by the region table's TX-power lookup.
    pub power_deci_dbm: i16,
}

/// Modulation, frequency and symbol timeout for an RX window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxSetting {
    pub freq_hz: u32,
    pub sf: SpreadingFactor,
    pub bw: Bandwidth,
    pub timeout_symbols: u16,
}

/// RSSI/SNR captured alongside a received frame, forwarded to the application in `Event::Rx`'s
/// sibling `LinkStatus` bookkeeping (the radio reports them; the MAC only reads them back).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct RxMetadata {
    pub rssi: i16,
    pub snr: i8,
}

/// Level-triggered status the scheduler polls on every `process()` call while an operation is in
/// flight -- the original stack's `LDL_Radio_getStatus` tri-state (`tx`, `rx`, `timeout`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RadioStatus {
    pub tx: bool,
    pub rx: bool,
    pub timeout: bool,
}

/// The transceiver capability the scheduler drives. Implementations talk to an SX127x/SX126x-class
/// chip over SPI/GPIO; this crate never assumes a concrete part.
pub trait Radio {
    type Error;

    fn set_mode(&mut self, mode: RadioMode) -> Result<(), Self::Error>;

    /// Samples the radio's wideband-noise entropy source once, used to seed an application RNG.
    fn read_entropy(&mut self) -> u32;

    /// Copies the most recently received frame into `data`, filling `meta`, and returns its length.
    fn read_buffer(&mut self, meta: &mut RxMetadata, data: &mut [u8]) -> usize;

    fn transmit(&mut self, setting: TxSetting, data: &[u8]) -> Result<(), Self::Error>;

    fn receive(&mut self, setting: RxSetting) -> Result<(), Self::Error>;

    /// Arms the radio to sample wideband noise; completion is observed via [`Self::get_status`].
    fn receive_entropy(&mut self) -> Result<(), Self::Error>;

    fn get_status(&mut self) -> RadioStatus;

    /// Crystal settling delay in milliseconds the scheduler must fold into RX-window timing.
    fn get_xtal_delay_ms(&self) -> u32;
}
