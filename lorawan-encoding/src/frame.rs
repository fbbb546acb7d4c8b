//! Encode/decode the six LoRaWAN PHY frame types.
//!
//! Grounded on the original stack's `ldl_frame` module: the encoder returns not just the frame
//! length but the byte offsets at which FOpts and FRMPayload begin, so the layer above can
//! encrypt those regions in place (the codec itself never touches keys).

use crate::stream::{ReadStream, Stream};

/// MHDR frame-type field occupies the top 3 bits; the low 5 bits must be zero on the air.
pub const PHY_OVERHEAD: usize = 5; // MHDR (1) + MIC (4)
pub const DATA_OVERHEAD: usize = 8; // FHDR without FOpts (7) + FPort (1)
pub const MAX_FOPTS_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FrameType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
}

impl FrameType {
    fn mhdr_code(self) -> u8 {
        match self {
            FrameType::JoinRequest => 0,
            FrameType::JoinAccept => 1,
            FrameType::UnconfirmedDataUp => 2,
            FrameType::UnconfirmedDataDown => 3,
            FrameType::ConfirmedDataUp => 4,
            FrameType::ConfirmedDataDown => 5,
            FrameType::RejoinRequest => 6,
        }
    }

    fn from_mhdr_code(code: u8) -> Option<FrameType> {
        match code {
            0 => Some(FrameType::JoinRequest),
            1 => Some(FrameType::JoinAccept),
            2 => Some(FrameType::UnconfirmedDataUp),
            3 => Some(FrameType::UnconfirmedDataDown),
            4 => Some(FrameType::ConfirmedDataUp),
            5 => Some(FrameType::ConfirmedDataDown),
            6 => Some(FrameType::RejoinRequest),
            _ => None,
        }
    }

    pub fn is_confirmed_up(self) -> bool {
        matches!(self, FrameType::ConfirmedDataUp)
    }

    pub fn is_data_down(self) -> bool {
        matches!(self, FrameType::UnconfirmedDataDown | FrameType::ConfirmedDataDown)
    }
}

/// Byte offsets into an encoded uplink data frame, returned by [`put_data`] so the caller can
/// encrypt FOpts and FRMPayload in place without re-parsing the frame it just wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataOffsets {
    pub fopts: usize,
    pub fopts_len: usize,
    pub frm_payload: usize,
    pub frm_payload_len: usize,
    pub total_len: usize,
}

/// Everything needed to encode an uplink data frame.
pub struct DataUp<'a> {
    pub confirmed: bool,
    pub dev_addr: u32,
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub fopts: &'a [u8],
    /// Full 32-bit uplink counter. Unlike a downlink counter, the device is the one incrementing
    /// it, so there is no reconstruction ambiguity -- only the low 16 bits go on the air.
    pub fcnt: u32,
    /// `None` means no FPort/FRMPayload at all (pure MAC-command frame carried in FOpts).
    pub port_and_payload: Option<(u8, &'a [u8])>,
}

/// Writes an uplink data frame (MHDR, DevAddr, FCtrl, FCnt, FOpts, optional FPort+FRMPayload,
/// and a zeroed MIC placeholder). Returns the offsets the caller needs for in-place encryption
/// and MIC patching. Fails (returns `None`) if `out` is too small or FOpts exceeds 15 bytes.
pub fn put_data(f: &DataUp, out: &mut [u8]) -> Option<DataOffsets> {
    if f.fopts.len() > MAX_FOPTS_LEN {
        return None;
    }
    let mut w = Stream::new(out);
    let frame_type =
        if f.confirmed { FrameType::ConfirmedDataUp } else { FrameType::UnconfirmedDataUp };
    w.put_u8(frame_type.mhdr_code() << 5);
    w.put_u32(f.dev_addr);

    let fctrl = (f.adr as u8) << 7
        | (f.adr_ack_req as u8) << 6
        | (f.ack as u8) << 5
        | (f.fopts.len() as u8 & 0x0F);
    w.put_u8(fctrl);
    w.put_u16(f.fcnt as u16);

    let fopts_offset = w.tell();
    w.put_bytes(f.fopts);

    let (frm_payload_offset, frm_payload_len) = if let Some((port, payload)) = f.port_and_payload {
        w.put_u8(port);
        let off = w.tell();
        w.put_bytes(payload);
        (off, payload.len())
    } else {
        (w.tell(), 0)
    };

    // MIC placeholder, patched later by update_mic once the layer above has computed it.
    w.put_u32(0);

    if w.error() {
        None
    } else {
        Some(DataOffsets {
            fopts: fopts_offset,
            fopts_len: f.fopts.len(),
            frm_payload: frm_payload_offset,
            frm_payload_len,
            total_len: w.tell(),
        })
    }
}

/// Overwrites the last 4 bytes of an encoded frame with the computed MIC.
pub fn update_mic(buf: &mut [u8], mic: u32) -> bool {
    if buf.len() < 4 {
        return false;
    }
    let offset = buf.len() - 4;
    buf[offset..].copy_from_slice(&mic.to_le_bytes());
    true
}

/// Everything needed to encode a join-request frame.
pub struct JoinRequest {
    pub join_eui: [u8; 8],
    pub dev_eui: [u8; 8],
    pub dev_nonce: u16,
}

pub fn put_join_request(f: &JoinRequest, out: &mut [u8]) -> Option<usize> {
    let mut w = Stream::new(out);
    w.put_u8(FrameType::JoinRequest.mhdr_code() << 5);
    w.put_eui(&f.join_eui);
    w.put_eui(&f.dev_eui);
    w.put_u16(f.dev_nonce);
    w.put_u32(0); // MIC placeholder
    if w.error() {
        None
    } else {
        Some(w.tell())
    }
}

/// Everything needed to encode a rejoin-request frame (types 0/1/2 per LoRaWAN 1.1 section 18).
pub struct RejoinRequest {
    pub rejoin_type: u8,
    pub net_id: u32,
    pub dev_eui: [u8; 8],
    pub rj_count: u16,
}

pub fn put_rejoin_request(f: &RejoinRequest, out: &mut [u8]) -> Option<usize> {
    let mut w = Stream::new(out);
    w.put_u8(FrameType::RejoinRequest.mhdr_code() << 5);
    w.put_u8(f.rejoin_type);
    w.put_u24(f.net_id);
    w.put_eui(&f.dev_eui);
    w.put_u16(f.rj_count);
    w.put_u32(0);
    if w.error() {
        None
    } else {
        Some(w.tell())
    }
}

/// A decoded downlink frame. Join-Accept fields and data fields overlap the same struct the way
/// the original C union does -- callers match on `kind` before reading the relevant half.
#[derive(Debug, Clone, Copy)]
pub enum Downlink<'a> {
    JoinAccept {
        join_nonce: u32,
        net_id: u32,
        dev_addr: u32,
        rx1_dr_offset: u8,
        rx2_dr: u8,
        rx_delay: u8,
        opt_neg: bool,
        cf_list: Option<&'a [u8; 16]>,
        /// Byte range covered by the MIC computation (everything but the trailing 4 bytes).
        mic: u32,
        /// Raw bytes before the MHDR was stripped off, kept for MIC re-verification.
        body: &'a [u8],
    },
    Data {
        confirmed: bool,
        dev_addr: u32,
        ack: bool,
        adr: bool,
        adr_ack_req: bool,
        f_pending: bool,
        fcnt: u16,
        fopts: &'a [u8],
        port_and_payload: Option<(u8, &'a [u8])>,
        mic: u32,
        body: &'a [u8],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    TooShort,
    BadMhdr,
    OptsAndPort0Coexist,
    TrailingBytes,
    UnsupportedType,
}

/// Decodes a downlink PHY payload. Recognizes the frame type from MHDR's top 3 bits (the low 5
/// bits must be zero). Rejects frames where FOpts and a port-0 FRMPayload both appear, per the
/// spec's "never both present" invariant.
pub fn decode(buf: &[u8]) -> Result<Downlink<'_>, DecodeError> {
    if buf.len() < PHY_OVERHEAD {
        return Err(DecodeError::TooShort);
    }
    let mhdr = buf[0];
    if mhdr & 0x1F != 0 {
        return Err(DecodeError::BadMhdr);
    }
    let frame_type = FrameType::from_mhdr_code(mhdr >> 5).ok_or(DecodeError::BadMhdr)?;

    match frame_type {
        FrameType::JoinAccept => decode_join_accept(buf),
        FrameType::UnconfirmedDataDown | FrameType::ConfirmedDataDown => {
            decode_data_down(buf, frame_type == FrameType::ConfirmedDataDown)
        }
        _ => Err(DecodeError::UnsupportedType),
    }
}

fn decode_join_accept(buf: &[u8]) -> Result<Downlink<'_>, DecodeError> {
    let mic_offset = buf.len().checked_sub(4).ok_or(DecodeError::TooShort)?;
    let mut r = ReadStream::new(&buf[1..mic_offset]);
    let join_nonce = r.get_u24().ok_or(DecodeError::TooShort)?;
    let net_id = r.get_u24().ok_or(DecodeError::TooShort)?;
    let dev_addr = r.get_u32().ok_or(DecodeError::TooShort)?;
    let dl_settings = r.get_u8().ok_or(DecodeError::TooShort)?;
    let opt_neg = dl_settings & 0x80 != 0;
    let rx1_dr_offset = (dl_settings >> 4) & 0x07;
    let rx2_dr = dl_settings & 0x0F;
    let rx_delay_raw = r.get_u8().ok_or(DecodeError::TooShort)?;
    let rx_delay = if rx_delay_raw == 0 { 1 } else { rx_delay_raw };

    let cf_list = match r.remaining() {
        16 => {
            let bytes = r.get_bytes(16).ok_or(DecodeError::TooShort)?;
            let arr: &[u8; 16] = bytes.try_into().unwrap();
            Some(arr)
        }
        0 => None,
        _ => return Err(DecodeError::TrailingBytes),
    };
    if r.remaining() != 0 {
        return Err(DecodeError::TrailingBytes);
    }

    let mic = u32::from_le_bytes(buf[mic_offset..].try_into().unwrap());

    Ok(Downlink::JoinAccept {
        join_nonce,
        net_id,
        dev_addr,
        rx1_dr_offset,
        rx2_dr,
        rx_delay,
        opt_neg,
        cf_list,
        mic,
        body: &buf[..mic_offset],
    })
}

fn decode_data_down(buf: &[u8], confirmed: bool) -> Result<Downlink<'_>, DecodeError> {
    let mic_offset = buf.len().checked_sub(4).ok_or(DecodeError::TooShort)?;
    let mut r = ReadStream::new(&buf[1..mic_offset]);
    let dev_addr = r.get_u32().ok_or(DecodeError::TooShort)?;
    let fctrl = r.get_u8().ok_or(DecodeError::TooShort)?;
    let adr = fctrl & 0x80 != 0;
    let adr_ack_req = fctrl & 0x40 != 0;
    let ack = fctrl & 0x20 != 0;
    let f_pending = fctrl & 0x10 != 0;
    let fopts_len = (fctrl & 0x0F) as usize;
    let fcnt = r.get_u16().ok_or(DecodeError::TooShort)?;
    let fopts = r.get_bytes(fopts_len).ok_or(DecodeError::TooShort)?;

    let port_and_payload = if r.remaining() > 0 {
        let port = r.get_u8().ok_or(DecodeError::TooShort)?;
        let payload_len = r.remaining();
        let payload = r.get_bytes(payload_len).ok_or(DecodeError::TooShort)?;
        if port == 0 && fopts_len > 0 {
            return Err(DecodeError::OptsAndPort0Coexist);
        }
        Some((port, payload))
    } else {
        None
    };

    let mic = u32::from_le_bytes(buf[mic_offset..].try_into().unwrap());

    Ok(Downlink::Data {
        confirmed,
        dev_addr,
        ack,
        adr,
        adr_ack_req,
        f_pending,
        fcnt,
        fopts,
        port_and_payload,
        mic,
        body: &buf[..mic_offset],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_up_offsets_match_decoded_layout() {
        let mut buf = [0u8; 64];
        let f = DataUp {
            confirmed: false,
            dev_addr: 0x1234_5678,
            adr: true,
            adr_ack_req: false,
            ack: false,
            fopts: &[0x02],
            fcnt: 7,
            port_and_payload: Some((1, &[0xAA, 0xBB, 0xCC])),
        };
        let off = put_data(&f, &mut buf).unwrap();
        assert_eq!(off.fopts_len, 1);
        assert_eq!(&buf[off.fopts..off.fopts + 1], &[0x02]);
        assert_eq!(off.frm_payload_len, 3);
        assert_eq!(&buf[off.frm_payload..off.frm_payload + 3], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(off.total_len, buf.len() - (buf.len() - off.total_len));
    }

    #[test]
    fn fopts_over_15_bytes_rejected() {
        let mut buf = [0u8; 64];
        let fopts = [0u8; 16];
        let f = DataUp {
            confirmed: false,
            dev_addr: 0,
            adr: false,
            adr_ack_req: false,
            ack: false,
            fopts: &fopts,
            fcnt: 0,
            port_and_payload: None,
        };
        assert!(put_data(&f, &mut buf).is_none());
    }

    #[test]
    fn join_accept_round_trips_without_cflist() {
        let mut buf = [0u8; 32];
        {
            let mut w = Stream::new(&mut buf);
            w.put_u8(FrameType::JoinAccept.mhdr_code() << 5);
            w.put_u24(0x00_00_01); // join nonce
            w.put_u24(0x00_00_13); // net id
            w.put_u32(0x2601_1BDA); // dev addr
            w.put_u8(0x00); // dlsettings: optneg=0, rx1droffset=0, rx2dr=0
            w.put_u8(1); // rx delay
            w.put_u32(0xDEAD_BEEF); // mic placeholder
        }
        let decoded = decode(&buf[..17]).unwrap();
        match decoded {
            Downlink::JoinAccept { net_id, dev_addr, rx_delay, cf_list, .. } => {
                assert_eq!(net_id, 0x13);
                assert_eq!(dev_addr, 0x2601_1BDA);
                assert_eq!(rx_delay, 1);
                assert!(cf_list.is_none());
            }
            _ => panic!("expected join accept"),
        }
    }

    #[test]
    fn join_accept_rx_delay_zero_coerces_to_one() {
        let mut buf = [0u8; 17];
        {
            let mut w = Stream::new(&mut buf);
            w.put_u8(FrameType::JoinAccept.mhdr_code() << 5);
            w.put_u24(0);
            w.put_u24(0);
            w.put_u32(0);
            w.put_u8(0);
            w.put_u8(0); // rxDelay = 0 -> coerced to 1
            w.put_u32(0);
        }
        match decode(&buf).unwrap() {
            Downlink::JoinAccept { rx_delay, .. } => assert_eq!(rx_delay, 1),
            _ => panic!(),
        }
    }

    #[test]
    fn data_down_rejects_fopts_and_port0_payload() {
        let mut buf = [0u8; 32];
        let mut w = Stream::new(&mut buf);
        w.put_u8(FrameType::UnconfirmedDataDown.mhdr_code() << 5);
        w.put_u32(0x1234_5678);
        w.put_u8(0x01); // fctrl: fopts_len = 1
        w.put_u16(0);
        w.put_u8(0x02); // single fopt byte
        w.put_u8(0); // fport 0
        w.put_u8(0xFF); // "mac command" byte masquerading as payload
        w.put_u32(0);
        let len = w.tell();
        assert_eq!(decode(&buf[..len]), Err(DecodeError::OptsAndPort0Coexist));
    }
}
