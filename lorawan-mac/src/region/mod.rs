//! Regional PHY parameter tables: rate/frequency conversion, RX1 offset, join rate schedule,
//! duty-cycle band classification, TX-power table, and CFList unpacking.
//!
//! Grounded directly on `ldl_region.c`'s table layout -- a `match` over [`Region`] dispatching to
//! per-region constant tables -- rather than the teacher's trait-object `RegionHandler`, because
//! the original's flat switch is what the four regions implemented here (EU868, EU433, US915,
//! AU915) actually need; a trait only pays for itself once a region needs custom *behaviour*; ours
//! just look things up. Per-region `Cargo.toml` features gate both the `Region` variant and its
//! submodule the way the teacher's `lorawan-device/src/region/mod.rs` gates `AS923_1`..`US915`.

#[cfg(not(any(
    feature = "region-eu868",
    feature = "region-eu433",
    feature = "region-us915",
    feature = "region-au915"
)))]
compile_error!("You must enable at least one region! eg: `region-eu868`, `region-us915`...");

#[cfg(feature = "region-au915")]
mod au915;
#[cfg(feature = "region-eu433")]
mod eu433;
#[cfg(feature = "region-eu868")]
mod eu868;
#[cfg(feature = "region-us915")]
mod us915;

/// One of the regional channel plans this core implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Region {
    #[cfg(feature = "region-eu868")]
    Eu868,
    #[cfg(feature = "region-eu433")]
    Eu433,
    #[cfg(feature = "region-us915")]
    Us915,
    #[cfg(feature = "region-au915")]
    Au915,
}

impl Region {
    pub fn is_fixed_channel_plan(self) -> bool {
        #[allow(unreachable_patterns)]
        match self {
            #[cfg(feature = "region-us915")]
            Region::Us915 => true,
            #[cfg(feature = "region-au915")]
            Region::Au915 => true,
            _ => false,
        }
    }
}

/// Bandwidth/spreading-factor pair plus the maximum MAC payload size it allows, indexed by
/// data-rate number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatarateParams {
    pub bandwidth_hz: u32,
    pub spreading_factor: u8,
    pub max_mac_payload_size: u16,
}

/// Frequency, min/max data rate and duty-cycle band for a join-accept default or a network-added
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    pub freq_hz: u32,
    pub min_dr: u8,
    pub max_dr: u8,
}

pub fn datarate(region: Region, dr: u8) -> Option<DatarateParams> {
    match region {
        #[cfg(feature = "region-eu868")]
        Region::Eu868 => eu868::DATARATES.get(dr as usize).copied(),
        #[cfg(feature = "region-eu433")]
        Region::Eu433 => eu433::DATARATES.get(dr as usize).copied(),
        #[cfg(feature = "region-us915")]
        Region::Us915 => us915::DATARATES.get(dr as usize).copied().flatten(),
        #[cfg(feature = "region-au915")]
        Region::Au915 => au915::DATARATES.get(dr as usize).copied().flatten(),
    }
}

/// Default join channels: the three fixed channels a dynamic-plan device always starts with, or
/// `&[]` for a fixed-plan region (where join channel selection instead uses [`join_channel_index`]).
pub fn default_join_channels(region: Region) -> &'static [ChannelParams] {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(feature = "region-eu868")]
        Region::Eu868 => &eu868::JOIN_CHANNELS,
        #[cfg(feature = "region-eu433")]
        Region::Eu433 => &eu433::JOIN_CHANNELS,
        _ => &[],
    }
}

/// RX1 data rate as a function of the uplink rate and the network-configured RX1 offset,
/// grounded on `LDL_Region_getRX1DataRate`'s per-region lookup tables.
pub fn rx1_data_rate(region: Region, tx_rate: u8, rx1_offset: u8) -> u8 {
    #[allow(unreachable_patterns)]
    let (table, cols): (&[u8], usize) = match region {
        #[cfg(any(feature = "region-eu868", feature = "region-eu433"))]
        Region::Eu868 | Region::Eu433 => (
            &[
                0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 2, 1, 0, 0, 0, 0, 3, 2, 1, 0, 0, 0, 4, 3, 2, 1, 0, 0, 5, 4, 3, 2,
                1, 0, 6, 5, 4, 3, 2, 1, 7, 6, 5, 4, 3, 2,
            ],
            6,
        ),
        #[cfg(feature = "region-us915")]
        Region::Us915 => (&[10, 9, 8, 8, 11, 10, 9, 8, 12, 11, 10, 9, 13, 12, 11, 10, 13, 13, 12, 11], 4),
        #[cfg(feature = "region-au915")]
        Region::Au915 => (
            &[
                8, 8, 8, 8, 8, 8, 9, 8, 8, 8, 8, 8, 10, 9, 8, 8, 8, 8, 11, 10, 9, 8, 8, 8, 12, 11, 10, 9, 8, 8, 13,
                12, 11, 10, 9, 8, 13, 13, 12, 11, 10, 9,
            ],
            6,
        ),
    };
    let i = tx_rate as usize * cols + rx1_offset as usize;
    table.get(i).copied().unwrap_or(tx_rate)
}

/// For dynamic-plan regions, RX1 reuses the uplink frequency. For fixed-plan regions, RX1 lives
/// on one of 8 fixed downlink channels selected by `tx_channel_index % 8`.
pub fn rx1_freq_hz(region: Region, tx_freq_hz: u32, tx_channel_index: u8) -> u32 {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(any(feature = "region-us915", feature = "region-au915"))]
        Region::Us915 | Region::Au915 => 923_300_000 + (tx_channel_index as u32 % 8) * 600_000,
        _ => tx_freq_hz,
    }
}

pub fn rx2_freq_hz(region: Region) -> u32 {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(any(feature = "region-us915", feature = "region-au915"))]
        Region::Us915 | Region::Au915 => 923_300_000,
        _ => 869_525_000,
    }
}

pub fn rx2_rate(region: Region) -> u8 {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(any(feature = "region-us915", feature = "region-au915"))]
        Region::Us915 | Region::Au915 => 8,
        _ => 0,
    }
}

pub fn validate_freq(region: Region, freq_hz: u32) -> bool {
    match region {
        #[cfg(feature = "region-eu868")]
        Region::Eu868 => freq_hz > 863_000_000 && freq_hz < 870_000_000,
        #[cfg(feature = "region-eu433")]
        Region::Eu433 => (433_175_000..=434_665_000).contains(&freq_hz),
        #[cfg(feature = "region-us915")]
        Region::Us915 => freq_hz > 902_000_000 && freq_hz < 928_000_000,
        #[cfg(feature = "region-au915")]
        Region::Au915 => freq_hz > 915_000_000 && freq_hz < 928_000_000,
    }
}

pub fn validate_tx_power(region: Region, power: u8) -> bool {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(feature = "region-eu868")]
        Region::Eu868 => power <= 7,
        #[cfg(feature = "region-eu433")]
        Region::Eu433 => power <= 5,
        #[cfg(any(feature = "region-us915", feature = "region-au915"))]
        Region::Us915 | Region::Au915 => power <= 10,
    }
}

/// TX EIRP in deci-dBm (tenths of a dBm) for a given power step, saturating at the region's
/// maximum step like the original's `LDL_Region_getTXPower`.
pub fn tx_power_deci_dbm(region: Region, power: u8) -> i16 {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(feature = "region-eu868")]
        Region::Eu868 => 1600 - (power.min(7) as i16) * 200,
        #[cfg(feature = "region-eu433")]
        Region::Eu433 => 1215 - (power.min(5) as i16) * 200,
        #[cfg(any(feature = "region-us915", feature = "region-au915"))]
        Region::Us915 | Region::Au915 => 3000 - (power.min(10) as i16) * 200,
    }
}

/// Data rate a dynamic-plan join request is sent at on its `trial`'th attempt: EU-family regions
/// rotate DR5 down to DR0 and back; fixed-plan regions fix the join rate.
pub fn join_rate(region: Region, trial: u32) -> u8 {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(any(feature = "region-eu868", feature = "region-eu433"))]
        Region::Eu868 | Region::Eu433 => 5u8.wrapping_sub((trial % 6) as u8),
        #[cfg(feature = "region-us915")]
        Region::Us915 => 0,
        #[cfg(feature = "region-au915")]
        Region::Au915 => 2,
    }
}

/// Duty-cycle sub-band classification (EU-family only; fixed-plan regions have no regulatory
/// duty-cycle limit and always report an off-time factor of 0, i.e. no enforced off-time --
/// `register_time` still tracks the global band for them when `max_duty_cycle_exp`/OTAA backoff
/// is active).
pub fn band_of(region: Region, freq_hz: u32) -> Option<(usize, u32)> {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(feature = "region-eu868")]
        Region::Eu868 => {
            if (863_000_000..=868_000_000).contains(&freq_hz) {
                Some((1, 100)) // 1% -> off_time_factor 100
            } else if (868_000_000..=868_600_000).contains(&freq_hz) {
                Some((2, 100))
            } else if (868_700_000..=869_200_000).contains(&freq_hz) {
                Some((3, 1000)) // 0.1%
            } else if (869_400_000..=869_650_000).contains(&freq_hz) {
                Some((4, 10)) // 10%
            } else if (869_700_000..870_000_000).contains(&freq_hz) {
                Some((5, 100))
            } else {
                None
            }
        }
        #[cfg(feature = "region-eu433")]
        Region::Eu433 => Some((1, 100)),
        #[cfg(any(feature = "region-us915", feature = "region-au915"))]
        Region::Us915 | Region::Au915 => Some((1, 0)),
    }
}

/// Index of a fixed-plan region's next join channel out of its 72 (64 @125kHz + 8 @500kHz)
/// channels, interleaving 500 kHz channels in on odd trials the way `LDL_Region_getJoinIndex` does.
pub fn join_channel_index(region: Region, trial: u32, random: u32) -> u8 {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(any(feature = "region-us915", feature = "region-au915"))]
        Region::Us915 | Region::Au915 => {
            if trial & 1 != 0 {
                (64 + (trial >> 1) % 8) as u8
            } else {
                ((((trial >> 1) % 8) * 8) + random % 8) as u8
            }
        }
        _ => 0,
    }
}

/// Frequency of a fixed-plan channel index (0..63 @125kHz, 64..71 @500kHz). Dynamic-plan regions
/// don't use indexed channel math this way; callers look up [`default_join_channels`] instead.
pub fn fixed_plan_channel_freq(region: Region, index: u8) -> Option<u32> {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(feature = "region-us915")]
        Region::Us915 => {
            if index < 64 {
                Some(902_300_000 + 200_000 * index as u32)
            } else if index < 72 {
                Some(903_000_000 + 1_600_000 * (index as u32 - 64))
            } else {
                None
            }
        }
        #[cfg(feature = "region-au915")]
        Region::Au915 => {
            if index < 64 {
                Some(915_200_000 + 200_000 * index as u32)
            } else if index < 72 {
                Some(915_900_000 + 1_600_000 * (index as u32 - 64))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Unpacks a 16-byte CFList (four little-endian 24-bit "freq/100" entries, Hz = value*100) for
/// dynamic-plan regions. Fixed-plan CFLists instead carry a channel-mask bitfield, which the
/// scheduler applies directly rather than going through this table.
pub fn unpack_cf_list_frequencies(cf_list: &[u8; 16]) -> [Option<u32>; 5] {
    let mut out = [None; 5];
    for (i, slot) in out.iter_mut().enumerate() {
        let base = i * 3;
        let raw = cf_list[base] as u32 | (cf_list[base + 1] as u32) << 8 | (cf_list[base + 2] as u32) << 16;
        if raw != 0 {
            *slot = Some(raw * 100);
        }
    }
    out
}

/// Unpacks a fixed-plan CFList (LoRaWAN CFListType 1): five little-endian 16-bit ChMask groups
/// covering the 72 channel indices, trailing byte is the type tag the caller has already used to
/// select this branch over [`unpack_cf_list_frequencies`].
pub fn unpack_cf_list_channel_mask(cf_list: &[u8; 16]) -> [u16; 5] {
    let mut out = [0u16; 5];
    for (i, slot) in out.iter_mut().enumerate() {
        let base = i * 2;
        *slot = u16::from_le_bytes([cf_list[base], cf_list[base + 1]]);
    }
    out
}

/// Whether this region's network is allowed to send `TxParamSetupReq` (dwell-time/EIRP control).
/// Only AU915 implements it among the four regions here, matching `LDL_Region_txParamSetupImplemented`.
pub fn tx_param_setup_implemented(region: Region) -> bool {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(feature = "region-au915")]
        Region::Au915 => true,
        _ => false,
    }
}

/// AU915's uplink dwell-time limit forces a minimum data rate (to keep the on-air symbol count,
/// and thus the channel occupancy, bounded): when dwell is active and the configured rate is
/// below DR2, it is raised to DR2. A no-op everywhere else.
pub fn apply_uplink_dwell(region: Region, dwell: bool, rate: u8) -> u8 {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(feature = "region-au915")]
        Region::Au915 if dwell && rate < 2 => 2,
        _ => rate,
    }
}

/// Cap (in duty-cycle time units) on accumulated global off-time beyond which the scheduler gives
/// up retrying rather than let a runaway accumulation (e.g. from a misbehaving max-duty-cycle
/// command) stall the device indefinitely -- approximately 30 minutes.
pub fn max_duty_cycle_off_limit() -> u32 {
    30 * 60 * crate::dutycycle::TIME_UNITS_PER_SECOND
}

/// Populates a freshly reset [`crate::session::ChannelStore`] with the region's default channels:
/// the three join channels for a dynamic-plan region ([`default_join_channels`]), or nothing for
/// a fixed-plan region (whose channel enablement instead lives in [`crate::session::Session::fixed_mask`]).
pub fn install_default_channels(region: Region, store: &mut crate::session::ChannelStore) {
    store.clear();
    for (i, ch) in default_join_channels(region).iter().enumerate() {
        store.set_channel(i, ch.freq_hz, ch.min_dr, ch.max_dr);
    }
}

/// Number of usable channel slots for this region: the dynamic store's installed count for
/// dynamic-plan regions, or the fixed 72-index space for US915/AU915.
pub fn num_channels(region: Region, store: &crate::session::ChannelStore) -> usize {
    if region.is_fixed_channel_plan() {
        72
    } else {
        store.len()
    }
}

/// Data-rate range a fixed-plan channel index supports: 125 kHz channels (index 0..64) carry the
/// region's join/uplink rate ladder, the 8 interleaved 500 kHz channels (index 64..72) carry a
/// single fixed rate used for both join and RX1-offset-0 uplinks.
pub fn fixed_plan_dr_range(region: Region, index: u8) -> Option<(u8, u8)> {
    #[allow(unreachable_patterns)]
    match region {
        #[cfg(feature = "region-us915")]
        Region::Us915 => {
            if index < 64 {
                Some((0, 3))
            } else if index < 72 {
                Some((4, 4))
            } else {
                None
            }
        }
        #[cfg(feature = "region-au915")]
        Region::Au915 => {
            if index < 64 {
                Some((0, 5))
            } else if index < 72 {
                Some((6, 6))
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "region-eu868")]
    fn eu868_rx1_offset_shifts_down_the_sf_ladder() {
        assert_eq!(rx1_data_rate(Region::Eu868, 5, 0), 5);
        assert_eq!(rx1_data_rate(Region::Eu868, 5, 5), 0);
    }

    #[test]
    #[cfg(feature = "region-us915")]
    fn us915_fixed_channel_frequencies_match_the_formula() {
        assert_eq!(fixed_plan_channel_freq(Region::Us915, 0), Some(902_300_000));
        assert_eq!(fixed_plan_channel_freq(Region::Us915, 63), Some(902_300_000 + 63 * 200_000));
        assert_eq!(fixed_plan_channel_freq(Region::Us915, 64), Some(903_000_000));
        assert_eq!(fixed_plan_channel_freq(Region::Us915, 72), None);
    }

    #[test]
    #[cfg(feature = "region-eu868")]
    fn eu868_band_classification_matches_regulatory_sub_bands() {
        assert_eq!(band_of(Region::Eu868, 868_100_000), Some((2, 100)));
        assert_eq!(band_of(Region::Eu868, 869_525_000), Some((4, 10)));
        assert_eq!(band_of(Region::Eu868, 800_000_000), None);
    }

    #[test]
    fn cf_list_unpacks_little_endian_24_bit_entries_scaled_by_100() {
        let mut raw = [0u8; 16];
        raw[0..3].copy_from_slice(&[0x00, 0x01, 0x00]); // 0x000100 = 256 -> 25600 Hz... matches helper below
        let unpacked = unpack_cf_list_frequencies(&raw);
        assert_eq!(unpacked[0], Some(256 * 100));
        assert_eq!(unpacked[1], None);
    }

    #[test]
    #[cfg(feature = "region-eu868")]
    fn tx_power_saturates_at_region_maximum_step() {
        assert_eq!(tx_power_deci_dbm(Region::Eu868, 7), 1600 - 7 * 200);
        assert_eq!(tx_power_deci_dbm(Region::Eu868, 20), 1600 - 7 * 200);
    }
}
