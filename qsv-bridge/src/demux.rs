//! Turns filled bitstream slots into container packets.
//!
//! Packets use the FLV/RTMP video tag layout: a five byte frame header with the
//! composition offset, then length-prefixed NAL units. Unregistered user data
//! SEI goes to a separate side channel buffer.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EncoderError;
use crate::nal::{
    NAL_AUD, NAL_SEI, NAL_SLICE, NAL_SLICE_IDR, NalHeader, PacketPriority,
    SEI_USER_DATA_UNREGISTERED, parse_sei, slice_ref_idc, split_annexb,
};
use crate::pool::CompletedSlot;
use crate::protocol::ms_from_ticks;

const KEYFRAME_TAG: u8 = 0x17;
const INTERFRAME_TAG: u8 = 0x27;
const AVC_NALU: u8 = 0x01;

/// Signed 24-bit range of the tag's composition time field.
const MAX_COMPOSITION_OFFSET: i64 = (1 << 23) - 1;
const MIN_COMPOSITION_OFFSET: i64 = -(1 << 23);

/// One demuxed frame. Timestamps are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// `None` when the slot held nothing for the main stream.
    pub packet: Option<Bytes>,
    pub priority: PacketPriority,
    pub keyframe: bool,
    pub pts: i64,
    /// Decode timestamp, rebased so the first output frame decodes at 0.
    pub dts: i64,
    pub composition_offset: i64,
    /// Timestamp the frame was submitted with.
    pub input_pts: i64,
}

fn put_unit(buf: &mut BytesMut, parts: &[&[u8]]) {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    buf.put_u32(len as u32);
    for part in parts {
        buf.put_slice(part);
    }
}

/// Per-session demux state.
#[derive(Debug, Default)]
pub struct Demuxer {
    frame_shift: i64,
    delay_offset: Option<i64>,
    sei: Bytes,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest side channel buffer, empty until a frame carries one.
    pub fn sei(&self) -> Bytes {
        self.sei.clone()
    }

    pub fn frame_shift(&self) -> i64 {
        self.frame_shift
    }

    /// Demuxes one completed slot whose decode timestamp, in ticks, is
    /// already resolved. A malformed slot leaves the state untouched.
    pub fn process(&mut self, dts_ticks: i64, slot: &CompletedSlot) -> Result<EncodedFrame> {
        let info = &slot.info;
        let pts_ticks = info.time_stamp as i64;

        let units = split_annexb(&slot.data);
        let mut body = BytesMut::with_capacity(slot.data.len() + units.len() * 4);
        let mut side = BytesMut::new();
        let mut first_slice_idr = None;
        let mut priority = PacketPriority::default();

        for unit in &units {
            let Some((&first, rest)) = unit.split_first() else {
                return Err(EncoderError::MalformedBitstream(format!(
                    "empty nal unit in bitstream slot {}",
                    slot.index
                ))
                .into());
            };
            let mut header = NalHeader::parse(first);
            match header.nal_type {
                NAL_SEI => {
                    for msg in parse_sei(rest)? {
                        let target = if msg.payload_type == SEI_USER_DATA_UNREGISTERED {
                            &mut side
                        } else {
                            &mut body
                        };
                        put_unit(target, &[msg.type_field, msg.payload]);
                    }
                }
                NAL_AUD => put_unit(&mut body, &[*unit]),
                NAL_SLICE | NAL_SLICE_IDR => {
                    if let Some(ref_idc) = slice_ref_idc(header.nal_type, info.frame_type) {
                        header.ref_idc = ref_idc;
                    }
                    if first_slice_idr.is_none() {
                        first_slice_idr = Some(header.nal_type == NAL_SLICE_IDR);
                    }
                    priority = priority.max(PacketPriority::from_ref_idc(header.ref_idc));
                    let nal_header = [header.to_byte()];
                    put_unit(&mut body, &[&nal_header[..], rest]);
                }
                other => log::trace!("skipping nal type {}", other),
            }
        }

        let pts = ms_from_ticks(pts_ticks);
        let dts_ms = ms_from_ticks(dts_ticks);
        let mut composition_offset = pts - dts_ms + self.frame_shift;
        if !units.is_empty() {
            if composition_offset < 0 {
                self.frame_shift -= composition_offset;
                composition_offset = 0;
            }
            if self.delay_offset.is_none() {
                self.delay_offset = Some(-dts_ms);
            }
        }
        if !(MIN_COMPOSITION_OFFSET..=MAX_COMPOSITION_OFFSET).contains(&composition_offset) {
            log::warn!(
                "composition offset {} ms does not fit 24 bits, clamping",
                composition_offset
            );
            composition_offset =
                composition_offset.clamp(MIN_COMPOSITION_OFFSET, MAX_COMPOSITION_OFFSET);
        }

        let packet = match first_slice_idr {
            Some(idr) => {
                let mut packet = BytesMut::with_capacity(body.len() + 5);
                packet.put_u8(if idr { KEYFRAME_TAG } else { INTERFRAME_TAG });
                packet.put_u8(AVC_NALU);
                packet.put_uint(composition_offset as u64 & 0xff_ffff, 3);
                packet.put_slice(&body);
                Some(packet.freeze())
            }
            None if !body.is_empty() => Some(body.freeze()),
            None => None,
        };

        if !side.is_empty() {
            self.sei = side.freeze();
        }

        Ok(EncodedFrame {
            packet,
            priority,
            keyframe: first_slice_idr.unwrap_or(false),
            pts,
            dts: dts_ms + self.delay_offset.unwrap_or(0),
            composition_offset,
            input_pts: ms_from_ticks(slot.input_timestamp),
        })
    }
}

/// Builds the AVC decoder configuration record from Annex B SPS and PPS units,
/// each still carrying its four byte start code.
pub fn build_decoder_config(sps: &[u8], pps: &[u8]) -> Result<Bytes, EncoderError> {
    if sps.len() < 8 || pps.len() < 5 {
        return Err(EncoderError::MalformedBitstream(format!(
            "sps of {} bytes or pps of {} bytes too short",
            sps.len(),
            pps.len()
        )));
    }
    let sps_body = &sps[4..];
    let pps_body = &pps[4..];
    if sps_body.len() > u16::MAX as usize || pps_body.len() > u16::MAX as usize {
        return Err(EncoderError::MalformedBitstream(format!(
            "sps of {} bytes or pps of {} bytes exceeds 16 bit length",
            sps_body.len(),
            pps_body.len()
        )));
    }
    let mut out = BytesMut::with_capacity(16 + sps_body.len() + pps_body.len());
    out.put_slice(&[KEYFRAME_TAG, 0, 0, 0, 0]);
    out.put_u8(0x01);
    out.put_slice(&sps[5..8]);
    out.put_u8(0xff);
    out.put_u8(0xe1);
    out.put_u16(sps_body.len() as u16);
    out.put_slice(sps_body);
    out.put_u8(0x01);
    out.put_u16(pps_body.len() as u16);
    out.put_slice(pps_body);
    Ok(out.freeze())
}

/// Decoder configuration record, derived on first request.
#[derive(Debug, Default)]
pub struct DecoderConfig {
    record: Option<Bytes>,
}

impl DecoderConfig {
    pub fn get_or_build<F>(&mut self, fetch: F) -> Result<Bytes>
    where
        F: FnOnce() -> Result<(Vec<u8>, Vec<u8>)>,
    {
        if let Some(record) = &self.record {
            return Ok(record.clone());
        }
        let (sps, pps) = fetch()?;
        let record = build_decoder_config(&sps, &pps)?;
        self.record = Some(record.clone());
        Ok(record)
    }

    pub fn get(&self) -> Option<Bytes> {
        self.record.clone()
    }
}
