//! US902-928 fixed-channel-plan parameters, grounded on the teacher's
//! `lorawan-device/src/region/fixed_channel_plans/us915/datarates.rs`. DR5/DR6 (LR-FHSS) and DR7
//! (RFU) are unimplemented per §1 Non-goals (PHY types other than LoRa modulation) and read back
//! as `None`.

use super::DatarateParams;

pub const DATARATES: [Option<DatarateParams>; 14] = [
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 10, max_mac_payload_size: 19 }), // DR0
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 9, max_mac_payload_size: 61 }), // DR1
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 8, max_mac_payload_size: 133 }), // DR2
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 7, max_mac_payload_size: 250 }), // DR3
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 8, max_mac_payload_size: 250 }), // DR4
    None, // DR5: LR-FHSS, unimplemented
    None, // DR6: LR-FHSS, unimplemented
    None, // DR7: RFU
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 12, max_mac_payload_size: 61 }), // DR8
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 11, max_mac_payload_size: 137 }), // DR9
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 10, max_mac_payload_size: 250 }), // DR10
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 9, max_mac_payload_size: 250 }), // DR11
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 8, max_mac_payload_size: 250 }), // DR12
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 7, max_mac_payload_size: 250 }), // DR13
];
