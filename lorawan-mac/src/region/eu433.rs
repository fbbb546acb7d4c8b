//! EU433 regional parameters, grounded on the teacher's
//! `lorawan-device/src/region/dynamic_channel_plans/eu433.rs`.

use super::{ChannelParams, DatarateParams};

pub const DATARATES: [DatarateParams; 7] = [
    DatarateParams { bandwidth_hz: 125_000, spreading_factor: 12, max_mac_payload_size: 59 },
    DatarateParams { bandwidth_hz: 125_000, spreading_factor: 11, max_mac_payload_size: 59 },
    DatarateParams { bandwidth_hz: 125_000, spreading_factor: 10, max_mac_payload_size: 123 },
    DatarateParams { bandwidth_hz: 125_000, spreading_factor: 9, max_mac_payload_size: 123 },
    DatarateParams { bandwidth_hz: 125_000, spreading_factor: 8, max_mac_payload_size: 250 },
    DatarateParams { bandwidth_hz: 125_000, spreading_factor: 7, max_mac_payload_size: 250 },
    DatarateParams { bandwidth_hz: 250_000, spreading_factor: 7, max_mac_payload_size: 250 },
];

pub const JOIN_CHANNELS: [ChannelParams; 3] = [
    ChannelParams { freq_hz: 433_175_000, min_dr: 0, max_dr: 5 },
    ChannelParams { freq_hz: 433_375_000, min_dr: 0, max_dr: 5 },
    ChannelParams { freq_hz: 433_575_000, min_dr: 0, max_dr: 5 },
];
