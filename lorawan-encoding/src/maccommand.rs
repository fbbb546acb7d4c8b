//! MAC command codec: encodes commands an end-device sends upstream (piggybacked in FOpts or a
//! port-0 FRMPayload) and decodes commands a network server sends downstream.
//!
//! Tag assignment and field packing are grounded on the original stack's `ldl_mac_commands`
//! module; a device only ever needs to *encode* `*Ans`/`*Ind`/`*Req`-with-no-answer commands and
//! *decode* the `*Req`/`*Ind`/`*Ans`-from-network counterparts, so unlike the original's shared
//! C union this codec exposes separate `Uplink`/`Downlink` enums.

use crate::stream::{ReadStream, Stream};

fn tag_for(cmd: CommandType) -> u8 {
    match cmd {
        CommandType::LinkCheck => 2,
        CommandType::LinkAdr => 3,
        CommandType::DutyCycle => 4,
        CommandType::RxParamSetup => 5,
        CommandType::DevStatus => 6,
        CommandType::NewChannel => 7,
        CommandType::RxTimingSetup => 8,
        CommandType::TxParamSetup => 9,
        CommandType::DlChannel => 10,
        CommandType::Rekey => 11,
        CommandType::AdrParamSetup => 12,
        CommandType::DeviceTime => 13,
        CommandType::ForceRejoin => 14,
        CommandType::RejoinParamSetup => 15,
    }
}

fn type_for_tag(tag: u8) -> Option<CommandType> {
    Some(match tag {
        2 => CommandType::LinkCheck,
        3 => CommandType::LinkAdr,
        4 => CommandType::DutyCycle,
        5 => CommandType::RxParamSetup,
        6 => CommandType::DevStatus,
        7 => CommandType::NewChannel,
        8 => CommandType::RxTimingSetup,
        9 => CommandType::TxParamSetup,
        10 => CommandType::DlChannel,
        11 => CommandType::Rekey,
        12 => CommandType::AdrParamSetup,
        13 => CommandType::DeviceTime,
        14 => CommandType::ForceRejoin,
        15 => CommandType::RejoinParamSetup,
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum CommandType {
    LinkCheck,
    LinkAdr,
    DutyCycle,
    RxParamSetup,
    DevStatus,
    NewChannel,
    RxTimingSetup,
    TxParamSetup,
    DlChannel,
    Rekey,
    AdrParamSetup,
    DeviceTime,
    ForceRejoin,
    RejoinParamSetup,
}

/// Wire length of the up-going answer for each command type, used to budget FOpts space before
/// a send is attempted.
pub fn size_of_command_up(cmd: CommandType) -> usize {
    match cmd {
        CommandType::LinkCheck
        | CommandType::DutyCycle
        | CommandType::RxTimingSetup
        | CommandType::TxParamSetup
        | CommandType::AdrParamSetup
        | CommandType::DeviceTime => 1,
        CommandType::LinkAdr
        | CommandType::RxParamSetup
        | CommandType::NewChannel
        | CommandType::DlChannel
        | CommandType::Rekey
        | CommandType::RejoinParamSetup => 2,
        CommandType::DevStatus | CommandType::ForceRejoin => 3,
    }
}

/// Peeks the tag byte at the front of the stream without consuming it.
pub fn peek_next_command(r: &ReadStream) -> Option<CommandType> {
    type_for_tag(r.peek()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAdrReq {
    pub data_rate: u8,
    pub tx_power: u8,
    pub channel_mask: u16,
    pub channel_mask_control: u8,
    pub nb_trans: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxParamSetupReq {
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: u8,
    pub freq_hz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewChannelReq {
    pub ch_index: u8,
    pub freq_hz: u32,
    pub max_dr: u8,
    pub min_dr: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlChannelReq {
    pub ch_index: u8,
    pub freq_hz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParamSetupReq {
    pub downlink_dwell: bool,
    pub uplink_dwell: bool,
    pub max_eirp_code: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdrParamSetupReq {
    pub limit_exp: u8,
    pub delay_exp: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceRejoinReq {
    pub period: u8,
    pub max_retries: u8,
    pub rejoin_type: u8,
    pub dr: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejoinParamSetupReq {
    pub max_time_n: u8,
    pub max_count_n: u8,
}

/// A command received from the network, carried downstream in a data-frame's FOpts or as the
/// sole content of a port-0 FRMPayload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downlink {
    LinkCheckAns { margin: u8, gw_count: u8 },
    LinkAdrReq(LinkAdrReq),
    DutyCycleReq { max_duty_cycle: u8 },
    RxParamSetupReq(RxParamSetupReq),
    DevStatusReq,
    NewChannelReq(NewChannelReq),
    RxTimingSetupReq { delay: u8 },
    TxParamSetupReq(TxParamSetupReq),
    DlChannelReq(DlChannelReq),
    RekeyConf { server_version: u8 },
    AdrParamSetupReq(AdrParamSetupReq),
    DeviceTimeAns { seconds: u32, fractions: u8 },
    ForceRejoinReq(ForceRejoinReq),
    RejoinParamSetupReq(RejoinParamSetupReq),
}

/// Decodes the next MAC command from a downlink FOpts/FRMPayload stream. Returns `Ok(None)` once
/// the stream is exhausted, `Err(())` on a malformed or unrecognized command (the stream's error
/// flag is also set in that case, so callers can stop parsing the rest of the block).
pub fn decode_downlink(r: &mut ReadStream) -> Result<Option<Downlink>, ()> {
    if r.remaining() == 0 {
        return Ok(None);
    }
    let tag = r.get_u8().ok_or(())?;
    let cmd_type = type_for_tag(tag).ok_or(())?;

    let cmd = match cmd_type {
        CommandType::LinkCheck => Downlink::LinkCheckAns {
            margin: r.get_u8().ok_or(())?,
            gw_count: r.get_u8().ok_or(())?,
        },
        CommandType::LinkAdr => {
            let buf = r.get_u8().ok_or(())?;
            let channel_mask = r.get_u16().ok_or(())?;
            let buf2 = r.get_u8().ok_or(())?;
            Downlink::LinkAdrReq(LinkAdrReq {
                data_rate: buf >> 4,
                tx_power: buf & 0x0F,
                channel_mask,
                channel_mask_control: (buf2 >> 4) & 0x07,
                nb_trans: buf2 & 0x0F,
            })
        }
        CommandType::DutyCycle => {
            let buf = r.get_u8().ok_or(())?;
            Downlink::DutyCycleReq { max_duty_cycle: buf & 0x0F }
        }
        CommandType::RxParamSetup => {
            let dl_settings = r.get_u8().ok_or(())?;
            let freq = r.get_u24().ok_or(())?;
            Downlink::RxParamSetupReq(RxParamSetupReq {
                rx1_dr_offset: (dl_settings >> 4) & 0x07,
                rx2_data_rate: dl_settings & 0x0F,
                freq_hz: freq * 100,
            })
        }
        CommandType::DevStatus => Downlink::DevStatusReq,
        CommandType::NewChannel => {
            let ch_index = r.get_u8().ok_or(())?;
            let freq = r.get_u24().ok_or(())?;
            let buf = r.get_u8().ok_or(())?;
            Downlink::NewChannelReq(NewChannelReq {
                ch_index,
                freq_hz: freq * 100,
                max_dr: buf >> 4,
                min_dr: buf & 0x0F,
            })
        }
        CommandType::RxTimingSetup => {
            let buf = r.get_u8().ok_or(())?;
            Downlink::RxTimingSetupReq { delay: buf & 0x0F }
        }
        CommandType::TxParamSetup => {
            let buf = r.get_u8().ok_or(())?;
            Downlink::TxParamSetupReq(TxParamSetupReq {
                uplink_dwell: buf & 0x10 != 0,
                downlink_dwell: buf & 0x20 != 0,
                max_eirp_code: buf & 0x0F,
            })
        }
        CommandType::DlChannel => {
            let ch_index = r.get_u8().ok_or(())?;
            let freq = r.get_u24().ok_or(())?;
            Downlink::DlChannelReq(DlChannelReq { ch_index, freq_hz: freq * 100 })
        }
        CommandType::Rekey => {
            let buf = r.get_u8().ok_or(())?;
            Downlink::RekeyConf { server_version: buf & 0x0F }
        }
        CommandType::AdrParamSetup => {
            let buf = r.get_u8().ok_or(())?;
            Downlink::AdrParamSetupReq(AdrParamSetupReq {
                limit_exp: buf >> 4,
                delay_exp: buf & 0x0F,
            })
        }
        CommandType::DeviceTime => Downlink::DeviceTimeAns {
            seconds: r.get_u32().ok_or(())?,
            fractions: r.get_u8().ok_or(())?,
        },
        CommandType::ForceRejoin => {
            let buf = r.get_u16().ok_or(())?;
            Downlink::ForceRejoinReq(ForceRejoinReq {
                period: ((buf >> 10) & 0x07) as u8,
                max_retries: ((buf >> 7) & 0x07) as u8,
                rejoin_type: ((buf >> 4) & 0x07) as u8,
                dr: (buf & 0x0F) as u8,
            })
        }
        CommandType::RejoinParamSetup => {
            let buf = r.get_u8().ok_or(())?;
            Downlink::RejoinParamSetupReq(RejoinParamSetupReq {
                max_time_n: buf >> 4,
                max_count_n: buf & 0x0F,
            })
        }
    };

    if r.error() {
        Err(())
    } else {
        Ok(Some(cmd))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkAdrAns {
    pub power_ok: bool,
    pub data_rate_ok: bool,
    pub channel_mask_ok: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxParamSetupAns {
    pub rx1_dr_offset_ok: bool,
    pub rx2_data_rate_ok: bool,
    pub channel_ok: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevStatusAns {
    pub battery: u8,
    pub margin: i8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NewChannelAns {
    pub data_rate_range_ok: bool,
    pub channel_freq_ok: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlChannelAns {
    pub uplink_freq_ok: bool,
    pub channel_freq_ok: bool,
}

/// A command the device sends to the network, piggybacked in an uplink frame's FOpts (or, if it
/// would not fit, in a dedicated port-0 FRMPayload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uplink {
    LinkCheckReq,
    LinkAdrAns(LinkAdrAns),
    DutyCycleAns,
    RxParamSetupAns(RxParamSetupAns),
    DevStatusAns(DevStatusAns),
    NewChannelAns(NewChannelAns),
    RxTimingSetupAns,
    TxParamSetupAns,
    DlChannelAns(DlChannelAns),
    RekeyInd { device_version: u8 },
    AdrParamSetupAns,
    DeviceTimeReq,
    RejoinParamSetupAns { time_ok: bool },
}

/// Encodes a single uplink MAC command, returning `false` (and leaving `w` in its sticky-error
/// state) if there was not enough room.
pub fn encode_uplink(cmd: &Uplink, w: &mut Stream) -> bool {
    match cmd {
        Uplink::LinkCheckReq => w.put_u8(tag_for(CommandType::LinkCheck)),
        Uplink::LinkAdrAns(a) => {
            let buf = (a.power_ok as u8) << 2 | (a.data_rate_ok as u8) << 1 | a.channel_mask_ok as u8;
            w.put_u8(tag_for(CommandType::LinkAdr)) && w.put_u8(buf)
        }
        Uplink::DutyCycleAns => w.put_u8(tag_for(CommandType::DutyCycle)),
        Uplink::RxParamSetupAns(a) => {
            let buf = (a.rx1_dr_offset_ok as u8) << 2
                | (a.rx2_data_rate_ok as u8) << 1
                | a.channel_ok as u8;
            w.put_u8(tag_for(CommandType::RxParamSetup)) && w.put_u8(buf)
        }
        Uplink::DevStatusAns(a) => {
            w.put_u8(tag_for(CommandType::DevStatus))
                && w.put_u8(a.battery)
                && w.put_u8((a.margin as u8) & 0x3F)
        }
        Uplink::NewChannelAns(a) => {
            let buf = (a.data_rate_range_ok as u8) << 1 | a.channel_freq_ok as u8;
            w.put_u8(tag_for(CommandType::NewChannel)) && w.put_u8(buf)
        }
        Uplink::RxTimingSetupAns => w.put_u8(tag_for(CommandType::RxTimingSetup)),
        Uplink::TxParamSetupAns => w.put_u8(tag_for(CommandType::TxParamSetup)),
        Uplink::DlChannelAns(a) => {
            let buf = (a.uplink_freq_ok as u8) << 1 | a.channel_freq_ok as u8;
            w.put_u8(tag_for(CommandType::DlChannel)) && w.put_u8(buf)
        }
        Uplink::RekeyInd { device_version } => {
            w.put_u8(tag_for(CommandType::Rekey)) && w.put_u8(device_version & 0x0F)
        }
        Uplink::AdrParamSetupAns => w.put_u8(tag_for(CommandType::AdrParamSetup)),
        Uplink::DeviceTimeReq => w.put_u8(tag_for(CommandType::DeviceTime)),
        Uplink::RejoinParamSetupAns { time_ok } => {
            w.put_u8(tag_for(CommandType::RejoinParamSetup)) && w.put_u8(*time_ok as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_adr_req_unpacks_channel_mask_control_and_nb_trans() {
        let buf = [3u8, 0x5A, 0x00, 0xFF, 0x25];
        let mut r = ReadStream::new(&buf);
        let cmd = decode_downlink(&mut r).unwrap().unwrap();
        match cmd {
            Downlink::LinkAdrReq(req) => {
                assert_eq!(req.data_rate, 5);
                assert_eq!(req.tx_power, 10);
                assert_eq!(req.channel_mask, 0xFF00);
                assert_eq!(req.channel_mask_control, 2);
                assert_eq!(req.nb_trans, 5);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rx_param_setup_req_scales_frequency_by_100() {
        let buf = [5u8, 0x00, 0x01, 0x02, 0x03];
        let mut r = ReadStream::new(&buf);
        match decode_downlink(&mut r).unwrap().unwrap() {
            Downlink::RxParamSetupReq(req) => {
                assert_eq!(req.freq_hz, 0x03_02_01 * 100);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn dev_status_ans_round_trips() {
        let mut buf = [0u8; 8];
        let mut w = Stream::new(&mut buf);
        let ans = Uplink::DevStatusAns(DevStatusAns { battery: 200, margin: -5 });
        assert!(encode_uplink(&ans, &mut w));
        assert_eq!(w.as_written(), &[6, 200, (-5i8 as u8) & 0x3F]);
    }

    #[test]
    fn peek_does_not_consume() {
        let buf = [8u8, 0x03];
        let r = ReadStream::new(&buf);
        assert_eq!(peek_next_command(&r), Some(CommandType::RxTimingSetup));
        assert_eq!(r.tell(), 0);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let buf = [200u8];
        let mut r = ReadStream::new(&buf);
        assert!(decode_downlink(&mut r).is_err());
    }

    #[test]
    fn empty_stream_yields_none() {
        let buf: [u8; 0] = [];
        let mut r = ReadStream::new(&buf);
        assert_eq!(decode_downlink(&mut r), Ok(None));
    }
}
