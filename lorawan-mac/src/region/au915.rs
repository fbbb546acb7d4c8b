//! AU915-928 fixed-channel-plan parameters, grounded on the teacher's
//! `lorawan-device/src/region/fixed_channel_plans/au915/datarates.rs`. DR7 and DR14/DR15
//! (LR-FHSS / RFU) are unimplemented per §1 Non-goals and read back as `None`.

use super::DatarateParams;

pub const DATARATES: [Option<DatarateParams>; 16] = [
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 12, max_mac_payload_size: 59 }), // DR0
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 11, max_mac_payload_size: 59 }), // DR1
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 10, max_mac_payload_size: 59 }), // DR2
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 9, max_mac_payload_size: 123 }), // DR3
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 8, max_mac_payload_size: 250 }), // DR4
    Some(DatarateParams { bandwidth_hz: 125_000, spreading_factor: 7, max_mac_payload_size: 250 }), // DR5
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 8, max_mac_payload_size: 250 }), // DR6
    None, // DR7: LR-FHSS, unimplemented
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 12, max_mac_payload_size: 61 }), // DR8
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 11, max_mac_payload_size: 137 }), // DR9
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 10, max_mac_payload_size: 250 }), // DR10
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 9, max_mac_payload_size: 250 }), // DR11
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 8, max_mac_payload_size: 250 }), // DR12
    Some(DatarateParams { bandwidth_hz: 500_000, spreading_factor: 7, max_mac_payload_size: 250 }), // DR13
    None, // DR14: RFU
    None, // DR15: RFU
];
