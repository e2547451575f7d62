//! H.264 Annex B scanning and SEI message parsing.

use crate::error::EncoderError;
use crate::protocol::frame_type;

pub const NAL_SLICE: u8 = 1;
pub const NAL_SLICE_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

pub const SEI_USER_DATA_UNREGISTERED: u32 = 5;

/// Annex B start code (3-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x01];

const EMULATION_PREVENTION: &[u8] = &[0x00, 0x00, 0x03];

/// Packet importance, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub enum PacketPriority {
    #[default]
    Disposable,
    Low,
    High,
    Highest,
}

impl PacketPriority {
    pub fn from_ref_idc(ref_idc: u8) -> Self {
        match ref_idc & 0x3 {
            0 => PacketPriority::Disposable,
            1 => PacketPriority::Low,
            2 => PacketPriority::High,
            _ => PacketPriority::Highest,
        }
    }

    pub fn ref_idc(&self) -> u8 {
        *self as u8
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits an Annex B byte stream into NAL units with start codes stripped.
/// Zero bytes trailing a unit belong to the next 4-byte start code and are
/// dropped. Bytes before the first start code are ignored.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let Some(first) = find(data, START_CODE) else {
        return units;
    };
    let mut start = first + START_CODE.len();
    loop {
        let rest = &data[start..];
        let (unit, next) = match find(rest, START_CODE) {
            Some(pos) => (&rest[..pos], Some(start + pos + START_CODE.len())),
            None => (rest, None),
        };
        let trimmed = match unit.iter().rposition(|&b| b != 0) {
            Some(last) => &unit[..=last],
            None => &unit[..0],
        };
        units.push(trimmed);
        match next {
            Some(next) => start = next,
            None => break,
        }
    }
    units
}

/// Header byte fields of a NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader {
    pub ref_idc: u8,
    pub nal_type: u8,
}

impl NalHeader {
    pub fn parse(byte: u8) -> Self {
        Self {
            ref_idc: (byte >> 5) & 0x3,
            nal_type: byte & 0x1f,
        }
    }

    pub fn to_byte(&self) -> u8 {
        ((self.ref_idc << 5) & 0x60) | (self.nal_type & 0x1f)
    }

    pub fn is_slice(&self) -> bool {
        self.nal_type == NAL_SLICE || self.nal_type == NAL_SLICE_IDR
    }
}

/// Importance to write into a slice header, given the frame-type flags of
/// the picture. `None` leaves the header's value untouched.
pub fn slice_ref_idc(nal_type: u8, frame_flags: u32) -> Option<u8> {
    if nal_type == NAL_SLICE_IDR {
        return Some(PacketPriority::Highest.ref_idc());
    }
    if nal_type != NAL_SLICE {
        return None;
    }
    let mask = frame_type::REF | (frame_type::S - 1);
    let tier = match frame_flags & mask {
        f if f == frame_type::REF | frame_type::I || f == frame_type::REF | frame_type::P => {
            PacketPriority::High
        }
        f if f == frame_type::REF | frame_type::B => PacketPriority::Low,
        frame_type::B => PacketPriority::Disposable,
        _ => {
            log::warn!("unhandled frame type {:#x}", frame_flags);
            return None;
        }
    };
    Some(tier.ref_idc())
}

/// Reads one `0xFF`-extended SEI field (payload type or payload size).
/// Returns the value and the number of bytes consumed.
pub fn read_sei_value(data: &[u8]) -> Result<(u32, usize), EncoderError> {
    let mut value = 0u32;
    for (i, &b) in data.iter().enumerate() {
        value = value.saturating_add(b as u32);
        if b != 0xff {
            return Ok((value, i + 1));
        }
    }
    Err(EncoderError::MalformedBitstream(
        "sei field runs past the end of the unit".to_string(),
    ))
}

/// Length in raw bytes of an SEI payload of `size` unescaped bytes at the
/// start of `data`. Every `00 00 03` found inside the growing window adds the
/// emulation-prevention byte to the span.
pub fn escaped_payload_len(data: &[u8], size: usize) -> Result<usize, EncoderError> {
    let mut end = size;
    let mut search = 0;
    loop {
        if end > data.len() {
            return Err(EncoderError::MalformedBitstream(format!(
                "sei payload of {} bytes exceeds the {} remaining",
                end,
                data.len()
            )));
        }
        match find(&data[search..end], EMULATION_PREVENTION) {
            Some(pos) => {
                end += 1;
                search += pos + EMULATION_PREVENTION.len();
            }
            None => return Ok(end),
        }
    }
}

/// True when `data` is exactly `rbsp_trailing_bits`: `0x80` then zero bytes.
pub fn is_trailing_bits(data: &[u8]) -> bool {
    match data.split_first() {
        Some((&0x80, rest)) => rest.iter().all(|&b| b == 0),
        _ => false,
    }
}

/// One SEI message inside an SEI NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeiMessage<'a> {
    pub payload_type: u32,
    pub payload_size: u32,
    /// The payload-type field bytes as they appear in the stream.
    pub type_field: &'a [u8],
    /// Raw payload bytes, emulation prevention included.
    pub payload: &'a [u8],
}

impl SeiMessage<'_> {
    /// Framed form used in output packets: type field then raw payload.
    pub fn unit_len(&self) -> usize {
        self.type_field.len() + self.payload.len()
    }
}

/// Parses the messages of an SEI NAL unit. `rbsp` is the unit without its
/// header byte. Parsing stops at the trailing bits or the end of the unit.
pub fn parse_sei(rbsp: &[u8]) -> Result<Vec<SeiMessage<'_>>, EncoderError> {
    let mut messages = Vec::new();
    let mut pos = 0;
    while pos < rbsp.len() {
        if is_trailing_bits(&rbsp[pos..]) {
            break;
        }
        let (payload_type, type_len) = read_sei_value(&rbsp[pos..])?;
        let (payload_size, size_len) = read_sei_value(&rbsp[pos + type_len..])?;
        let payload_start = pos + type_len + size_len;
        let raw_len = escaped_payload_len(&rbsp[payload_start..], payload_size as usize)?;
        messages.push(SeiMessage {
            payload_type,
            payload_size,
            type_field: &rbsp[pos..pos + type_len],
            payload: &rbsp[payload_start..payload_start + raw_len],
        });
        pos = payload_start + raw_len;
    }
    Ok(messages)
}
