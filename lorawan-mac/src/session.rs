//! Persisted session state and the per-region channel store.
//!
//! Grounded on the original stack's `ldl_mac` context struct (`struct ldl_ctx`) and the teacher's
//! `lorawan-device/src/mac/session.rs`, but widened to cover the full 1.0.x/1.1 key hierarchy and
//! the channel mask/pending-command bookkeeping the original keeps alongside it.

use heapless::Vec;
use lorawan_encoding::maccommand::{DevStatusAns, DlChannelAns, LinkAdrAns, NewChannelAns, RxParamSetupAns};

pub const MAX_CHANNELS: usize = 16;

/// Which LoRaWAN MAC-layer key hierarchy a joined session is using. Fixed for the lifetime of a
/// session; only changes across a fresh OTAA join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum SessionVersion {
    V1_0,
    V1_1,
}

impl SessionVersion {
    pub fn is_1_1(self) -> bool {
        matches!(self, SessionVersion::V1_1)
    }
}

/// One entry in the channel store: a frequency plus the data-rate range the network has
/// authorized on it, and whether ADR has masked it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Channel {
    pub freq_hz: u32,
    pub min_dr: u8,
    pub max_dr: u8,
    pub masked: bool,
    /// RX1 frequency override installed by `DlChannelReq`; `0` means RX1 reuses `freq_hz`
    /// (the regional default for a dynamic-plan channel that has never been retargeted).
    pub dl_freq_hz: u32,
}

/// Bitmap of MAC-command answers the device owes the network on its next uplink.
///
/// Split into sticky answers (re-sent every uplink until a round trip clears them, mirroring the
/// original's retained `RXParamSetupAns`/`DLChannelAns`/`RXTimingSetupAns`/`RekeyInd` behaviour)
/// and single-shot answers (cleared as soon as they are enqueued once).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PendingAnswers {
    pub rekey: bool,
    pub rx_param_setup: bool,
    pub dl_channel: bool,
    pub rx_timing_setup: bool,

    pub link_adr: bool,
    pub dev_status: bool,
    pub new_channel: bool,
    pub rejoin_param_setup: bool,
    pub adr_param_setup: bool,
    pub tx_param_setup: bool,
    pub duty_cycle: bool,

    pub link_check_req: bool,
    pub device_time_req: bool,
}

/// Staged content for every pending answer in [`PendingAnswers`], captured at the moment the
/// inbound request was processed so the uplink that eventually carries it doesn't need to
/// re-derive anything (in particular `dev_status`'s margin, which depends on the SNR of whichever
/// downlink carried the `DevStatusReq`, not of the uplink answering it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct AnswerPayloads {
    pub link_adr: LinkAdrAns,
    pub rx_param_setup: RxParamSetupAns,
    pub dev_status: DevStatusAns,
    pub new_channel: NewChannelAns,
    pub dl_channel: DlChannelAns,
    pub rejoin_param_setup_time_ok: bool,
    pub rekey_device_version: u8,
}

/// Joined-session state: keys are not stored here (they live behind the `SecurityModule`), but
/// everything else the scheduler needs to build and validate the next frame is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Session {
    pub version: SessionVersion,
    pub dev_addr: u32,
    pub join_nonce: u32,
    pub net_id: u32,

    /// 32-bit widened DevNonce; only the low 16 bits are ever put on the air.
    pub dev_nonce_32: u32,

    pub fcnt_up: u32,
    /// High 16 bits of the reconstructed application downlink counter.
    pub fcnt_app_down_high: u16,
    /// High 16 bits of the reconstructed network downlink counter (1.1 FPort 0 only).
    pub fcnt_nwk_down_high: u16,

    pub rate: u8,
    pub power: u8,
    pub nb_trans: u8,
    pub adr_enabled: bool,
    pub adr_ack_counter: u16,

    pub rx1_dr_offset: u8,
    pub rx2_rate: u8,
    pub rx2_freq_hz: u32,
    pub rx_delay_s: u8,

    pub max_duty_cycle_exp: u8,
    pub adr_limit_exp: u8,
    pub adr_delay_exp: u8,

    /// AU915 uplink dwell-time limit, latched from `TxParamSetupReq`; floors the selectable data
    /// rate via [`crate::region::apply_uplink_dwell`]. Always `false` for regions that don't
    /// implement the command.
    pub uplink_dwell: bool,

    /// Channel-mask bitmap for fixed-plan regions (US915/AU915), 5x16 bits covering the 72
    /// formula-addressed channels; unused (stays all-zero, i.e. "no channels") for dynamic-plan
    /// regions, which use [`ChannelStore`] instead.
    pub fixed_mask: [u16; 5],

    pub pending: PendingAnswers,
    pub answers: AnswerPayloads,
}

impl Session {
    /// Builds a freshly-joined session's non-key fields, regional defaults for everything the
    /// network hasn't yet overridden via MAC commands: RX2 on the region's default channel/rate,
    /// a 1-second RX delay, and every fixed-plan channel index enabled (dynamic-plan regions start
    /// from [`ChannelStore`]'s defaults instead and leave `fixed_mask` all-zero).
    #[allow(clippy::too_many_arguments)]
    pub fn defaults(
        region: crate::region::Region,
        version: SessionVersion,
        dev_addr: u32,
        join_nonce: u32,
        net_id: u32,
        dev_nonce_32: u32,
        rate: u8,
        power: u8,
        adr_enabled: bool,
    ) -> Self {
        Self {
            version,
            dev_addr,
            join_nonce,
            net_id,
            dev_nonce_32,
            fcnt_up: 0,
            fcnt_app_down_high: 0,
            fcnt_nwk_down_high: 0,
            rate,
            power,
            nb_trans: 1,
            adr_enabled,
            adr_ack_counter: 0,
            rx1_dr_offset: 0,
            rx2_rate: crate::region::rx2_rate(region),
            rx2_freq_hz: crate::region::rx2_freq_hz(region),
            rx_delay_s: 1,
            max_duty_cycle_exp: 0,
            adr_limit_exp: 6,
            adr_delay_exp: 5,
            uplink_dwell: false,
            fixed_mask: if region.is_fixed_channel_plan() { Self::fixed_mask_default() } else { [0; 5] },
            pending: PendingAnswers::default(),
            answers: AnswerPayloads::default(),
        }
    }

    /// Number of unanswered uplinks (`1 << adr_limit_exp`) after which the next uplink sets
    /// ADRACKReq, per [`Self::adr_ack_counter`].
    pub fn adr_ack_limit(&self) -> u16 {
        1u16 << self.adr_limit_exp
    }

    /// Interval, after [`Self::adr_ack_limit`] is reached, on which ADR backs off one more step
    /// if still no downlink has arrived.
    pub fn adr_ack_delay(&self) -> u16 {
        1u16 << self.adr_delay_exp
    }

    /// Reconstructs the 32-bit down-counter from a 16-bit on-air value and the stored high half,
    /// per the original stack's `deriveDownCounter`: if the on-air value looks smaller than the
    /// low 16 bits we'd expect from the stored high half, the counter must have rolled over.
    pub fn derive_down_counter(&self, nwk_fport0: bool, fcnt16: u16) -> u32 {
        let stored_high = if self.version.is_1_1() && nwk_fport0 {
            self.fcnt_nwk_down_high
        } else {
            self.fcnt_app_down_high
        };
        let base = (stored_high as u32) << 16;
        if (fcnt16 as u32) < base {
            base.wrapping_add(0x1_0000).wrapping_add(fcnt16 as u32)
        } else {
            base + fcnt16 as u32
        }
    }

    /// Commits the high half of a just-verified down-counter back into session state.
    pub fn sync_down_counter(&mut self, nwk_fport0: bool, derived: u32) {
        let high = (derived >> 16) as u16;
        if self.version.is_1_1() && nwk_fport0 {
            self.fcnt_nwk_down_high = high;
        } else {
            self.fcnt_app_down_high = high;
        }
    }

    /// Whether a fixed-plan channel index is enabled (defaults to every index disabled until
    /// [`Self::fixed_mask_default`] or a NewChannel/CFList unpacking turns bits on).
    pub fn fixed_mask_get(&self, index: u8) -> bool {
        let group = (index / 16) as usize;
        let bit = index % 16;
        self.fixed_mask.get(group).is_some_and(|m| m & (1 << bit) != 0)
    }

    pub fn fixed_mask_set(&mut self, index: u8, enabled: bool) {
        let group = (index / 16) as usize;
        let bit = index % 16;
        if let Some(m) = self.fixed_mask.get_mut(group) {
            if enabled {
                *m |= 1 << bit;
            } else {
                *m &= !(1 << bit);
            }
        }
    }

    /// The regional default: every 125 kHz and 500 kHz channel enabled, matching a fresh
    /// fixed-plan join before any ADR-driven NewChannelReq narrows it.
    pub fn fixed_mask_default() -> [u16; 5] {
        [0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0x00FF]
    }

    pub fn fixed_mask_unmask_all(&mut self) {
        self.fixed_mask = Self::fixed_mask_default();
    }
}

/// Everything a freshly-joined or never-joined device needs alongside the (optional) `Session`:
/// the channel store, which persists across joins within a region.
pub struct ChannelStore {
    pub channels: Vec<Channel, MAX_CHANNELS>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self { channels: Vec::new() }
    }

    pub fn is_usable(&self, index: usize, rate: u8) -> bool {
        self.channels
            .get(index)
            .map(|c| !c.masked && rate >= c.min_dr && rate <= c.max_dr)
            .unwrap_or(false)
    }

    pub fn set_mask(&mut self, index: usize, masked: bool) -> bool {
        if let Some(c) = self.channels.get_mut(index) {
            c.masked = masked;
            true
        } else {
            false
        }
    }

    pub fn unmask_all(&mut self) {
        for c in self.channels.iter_mut() {
            c.masked = false;
        }
    }

    /// Installs (or disables, if `freq_hz == 0`) the channel at `index`, padding the store with
    /// disabled placeholder channels as needed. Mirrors the original stack's `LDL_MAC_addChannel`:
    /// an out-of-range index or an invalid frequency for the region is rejected by the caller
    /// before this is reached, so this only ever validates `index` against [`MAX_CHANNELS`].
    pub fn set_channel(&mut self, index: usize, freq_hz: u32, min_dr: u8, max_dr: u8) -> bool {
        if index >= MAX_CHANNELS {
            return false;
        }
        while self.channels.len() <= index {
            if self.channels.push(Channel { freq_hz: 0, min_dr: 0, max_dr: 0, masked: true, dl_freq_hz: 0 }).is_err() {
                return false;
            }
        }
        self.channels[index] = Channel { freq_hz, min_dr, max_dr, masked: freq_hz == 0, dl_freq_hz: 0 };
        true
    }

    /// Installs (or clears, with `freq_hz == 0`) a `DlChannelReq` RX1-frequency override for an
    /// already-installed channel. Returns `false` if the index has no channel installed yet.
    pub fn set_dl_freq(&mut self, index: usize, freq_hz: u32) -> bool {
        if let Some(c) = self.channels.get_mut(index) {
            c.dl_freq_hz = freq_hz;
            true
        } else {
            false
        }
    }

    pub fn get(&self, index: usize) -> Option<Channel> {
        self.channels.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Clears every installed channel, used by [`crate::mac::Mac::forget`] to restore a device to
    /// its pre-join state before [`crate::region::install_default_channels`] repopulates it.
    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(version: SessionVersion) -> Session {
        Session {
            version,
            dev_addr: 0,
            join_nonce: 0,
            net_id: 0,
            dev_nonce_32: 0,
            fcnt_up: 0,
            fcnt_app_down_high: 0,
            fcnt_nwk_down_high: 0,
            rate: 0,
            power: 0,
            nb_trans: 1,
            adr_enabled: true,
            adr_ack_counter: 0,
            rx1_dr_offset: 0,
            rx2_rate: 0,
            rx2_freq_hz: 869_525_000,
            rx_delay_s: 1,
            max_duty_cycle_exp: 0,
            adr_limit_exp: 0,
            adr_delay_exp: 0,
            uplink_dwell: false,
            fixed_mask: [0; 5],
            pending: PendingAnswers::default(),
            answers: AnswerPayloads::default(),
        }
    }

    #[test]
    fn down_counter_advances_high_half_on_wrap() {
        let mut s = session(SessionVersion::V1_0);
        s.fcnt_app_down_high = 0;
        let d1 = s.derive_down_counter(false, 0xFFFE);
        assert_eq!(d1, 0xFFFE);
        s.sync_down_counter(false, d1);

        let d2 = s.derive_down_counter(false, 2);
        assert_eq!(d2, 0x1_0002);
    }

    #[test]
    fn nwk_down_counter_only_used_for_1_1_port_zero() {
        let mut s = session(SessionVersion::V1_1);
        s.fcnt_nwk_down_high = 3;
        s.fcnt_app_down_high = 9;
        assert_eq!(s.derive_down_counter(true, 5), (3u32 << 16) + 5);
        assert_eq!(s.derive_down_counter(false, 5), (9u32 << 16) + 5);
    }
}
