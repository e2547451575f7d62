//! Fixed little-endian records exchanged through the shared regions.

use anyhow::Result;
use bytes::{Buf, BufMut};

use crate::ipc::SharedRegion;

/// Protocol timestamps run at 90 kHz.
pub const TICKS_PER_MS: i64 = 90;

pub fn ticks_from_ms(ms: i64) -> i64 {
    ms * TICKS_PER_MS
}

pub fn ms_from_ticks(ticks: i64) -> i64 {
    ticks / TICKS_PER_MS
}

/// Marks an empty filled-bitstream cell.
pub const NO_BITSTREAM: u32 = u32::MAX;

pub trait Record: Sized {
    const SIZE: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Self;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        self.encode(&mut buf);
        buf
    }

    fn read_from(region: &dyn SharedRegion, index: usize) -> Result<Self> {
        let mut buf = vec![0u8; Self::SIZE];
        region.read_at(index * Self::SIZE, &mut buf)?;
        Ok(Self::decode(&buf))
    }

    fn write_to(&self, region: &dyn SharedRegion, index: usize) -> Result<()> {
        region.write_at(index * Self::SIZE, &self.to_bytes())
    }
}

fn put_bool(buf: &mut &mut [u8], v: bool) {
    buf.put_u32_le(v as u32);
}

fn get_bool(buf: &mut &[u8]) -> bool {
    buf.get_u32_le() != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn at_least(&self, major: u16, minor: u16) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    #[default]
    Query,
    Encode,
}

/// Implementation override forwarded to the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImplOverride {
    pub implementation: u32,
    pub interface: u32,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitRequest {
    pub mode: RequestMode,
    pub host_process_id: u32,
    pub fps: u32,
    pub keyint: u32,
    pub bframes: u32,
    pub width: u32,
    pub height: u32,
    pub max_bitrate: u32,
    pub buffer_size: u32,
    pub use_cbr: bool,
    pub main_profile: bool,
    pub full_range: bool,
    pub matrix: u32,
    pub primaries: u32,
    pub transfer: u32,
    pub custom_impl: Option<ImplOverride>,
}

impl Record for InitRequest {
    const SIZE: usize = 20 * 4;

    fn encode(&self, mut buf: &mut [u8]) {
        let buf = &mut buf;
        buf.put_u32_le(match self.mode {
            RequestMode::Query => 0,
            RequestMode::Encode => 1,
        });
        buf.put_u32_le(self.host_process_id);
        buf.put_u32_le(self.fps);
        buf.put_u32_le(self.keyint);
        buf.put_u32_le(self.bframes);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.max_bitrate);
        buf.put_u32_le(self.buffer_size);
        put_bool(buf, self.use_cbr);
        put_bool(buf, self.main_profile);
        put_bool(buf, self.full_range);
        buf.put_u32_le(self.matrix);
        buf.put_u32_le(self.primaries);
        buf.put_u32_le(self.transfer);
        put_bool(buf, self.custom_impl.is_some());
        let custom = self.custom_impl.unwrap_or(ImplOverride {
            implementation: 0,
            interface: 0,
            version: Version::default(),
        });
        buf.put_u32_le(custom.implementation);
        buf.put_u32_le(custom.interface);
        buf.put_u32_le(custom.version.major as u32);
        buf.put_u32_le(custom.version.minor as u32);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let buf = &mut buf;
        let mode = match buf.get_u32_le() {
            0 => RequestMode::Query,
            _ => RequestMode::Encode,
        };
        let host_process_id = buf.get_u32_le();
        let fps = buf.get_u32_le();
        let keyint = buf.get_u32_le();
        let bframes = buf.get_u32_le();
        let width = buf.get_u32_le();
        let height = buf.get_u32_le();
        let max_bitrate = buf.get_u32_le();
        let buffer_size = buf.get_u32_le();
        let use_cbr = get_bool(buf);
        let main_profile = get_bool(buf);
        let full_range = get_bool(buf);
        let matrix = buf.get_u32_le();
        let primaries = buf.get_u32_le();
        let transfer = buf.get_u32_le();
        let use_custom = get_bool(buf);
        let custom = ImplOverride {
            implementation: buf.get_u32_le(),
            interface: buf.get_u32_le(),
            version: Version::new(buf.get_u32_le() as u16, buf.get_u32_le() as u16),
        };
        Self {
            mode,
            host_process_id,
            fps,
            keyint,
            bframes,
            width,
            height,
            max_bitrate,
            buffer_size,
            use_cbr,
            main_profile,
            full_range,
            matrix,
            primaries,
            transfer,
            custom_impl: use_custom.then_some(custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitResponse {
    pub version: Version,
    pub requested_impl: u32,
    pub actual_impl: u32,
    pub target_usage: u32,
    pub bitstream_num: u32,
    pub bitstream_size: u32,
    pub frame_num: u32,
    pub frame_size: u32,
    pub uv_offset: u32,
    pub v_offset: u32,
    pub frame_pitch: u32,
    pub bframe_delay: u32,
    pub frame_ticks: u64,
    pub using_custom_impl: bool,
}

impl Record for InitResponse {
    const SIZE: usize = 16 * 4;

    fn encode(&self, mut buf: &mut [u8]) {
        let buf = &mut buf;
        buf.put_u32_le(self.version.major as u32);
        buf.put_u32_le(self.version.minor as u32);
        buf.put_u32_le(self.requested_impl);
        buf.put_u32_le(self.actual_impl);
        buf.put_u32_le(self.target_usage);
        buf.put_u32_le(self.bitstream_num);
        buf.put_u32_le(self.bitstream_size);
        buf.put_u32_le(self.frame_num);
        buf.put_u32_le(self.frame_size);
        buf.put_u32_le(self.uv_offset);
        buf.put_u32_le(self.v_offset);
        buf.put_u32_le(self.frame_pitch);
        buf.put_u32_le(self.bframe_delay);
        buf.put_u64_le(self.frame_ticks);
        put_bool(buf, self.using_custom_impl);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let buf = &mut buf;
        Self {
            version: Version::new(buf.get_u32_le() as u16, buf.get_u32_le() as u16),
            requested_impl: buf.get_u32_le(),
            actual_impl: buf.get_u32_le(),
            target_usage: buf.get_u32_le(),
            bitstream_num: buf.get_u32_le(),
            bitstream_size: buf.get_u32_le(),
            frame_num: buf.get_u32_le(),
            frame_size: buf.get_u32_le(),
            uv_offset: buf.get_u32_le(),
            v_offset: buf.get_u32_le(),
            frame_pitch: buf.get_u32_le(),
            bframe_delay: buf.get_u32_le(),
            frame_ticks: buf.get_u64_le(),
            using_custom_impl: get_bool(buf),
        }
    }
}

/// One cell of the frame submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueuedFrame {
    pub is_new: bool,
    pub request_keyframe: bool,
    pub timestamp: u64,
    pub frame_index: u32,
}

impl Record for QueuedFrame {
    const SIZE: usize = 24;

    fn encode(&self, mut buf: &mut [u8]) {
        let buf = &mut buf;
        put_bool(buf, self.is_new);
        put_bool(buf, self.request_keyframe);
        buf.put_u64_le(self.timestamp);
        buf.put_u32_le(self.frame_index);
        buf.put_u32_le(0);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let buf = &mut buf;
        Self {
            is_new: get_bool(buf),
            request_keyframe: get_bool(buf),
            timestamp: buf.get_u64_le(),
            frame_index: buf.get_u32_le(),
        }
    }
}

/// Per bitstream slot metadata written by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitstreamInfo {
    pub time_stamp: u64,
    pub decode_time_stamp: i64,
    pub data_length: u32,
    pub data_offset: u32,
    pub pic_struct: u32,
    pub frame_type: u32,
}

impl Record for BitstreamInfo {
    const SIZE: usize = 32;

    fn encode(&self, mut buf: &mut [u8]) {
        let buf = &mut buf;
        buf.put_u64_le(self.time_stamp);
        buf.put_i64_le(self.decode_time_stamp);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(self.data_offset);
        buf.put_u32_le(self.pic_struct);
        buf.put_u32_le(self.frame_type);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let buf = &mut buf;
        Self {
            time_stamp: buf.get_u64_le(),
            decode_time_stamp: buf.get_i64_le(),
            data_length: buf.get_u32_le(),
            data_offset: buf.get_u32_le(),
            pic_struct: buf.get_u32_le(),
            frame_type: buf.get_u32_le(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpsPpsSizes {
    pub sps_size: u32,
    pub pps_size: u32,
}

impl Record for SpsPpsSizes {
    const SIZE: usize = 8;

    fn encode(&self, mut buf: &mut [u8]) {
        let buf = &mut buf;
        buf.put_u32_le(self.sps_size);
        buf.put_u32_le(self.pps_size);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let buf = &mut buf;
        Self {
            sps_size: buf.get_u32_le(),
            pps_size: buf.get_u32_le(),
        }
    }
}

/// Frame-type flags reported in [`BitstreamInfo::frame_type`].
pub mod frame_type {
    pub const I: u32 = 0x0001;
    pub const P: u32 = 0x0002;
    pub const B: u32 = 0x0004;
    pub const S: u32 = 0x0008;
    pub const REF: u32 = 0x0040;
    pub const IDR: u32 = 0x0080;
}

/// Implementation and interface selectors used by the helper.
pub mod implementation {
    pub const AUTO: u32 = 0x0000;
    pub const SOFTWARE: u32 = 0x0001;
    pub const HARDWARE: u32 = 0x0002;
    pub const AUTO_ANY: u32 = 0x0003;
    pub const HARDWARE_ANY: u32 = 0x0004;
    pub const HARDWARE2: u32 = 0x0005;
    pub const HARDWARE3: u32 = 0x0006;
    pub const HARDWARE4: u32 = 0x0007;

    pub const VIA_ANY: u32 = 0x0100;
    pub const VIA_D3D9: u32 = 0x0200;
    pub const VIA_D3D11: u32 = 0x0300;

    const NAMES: [&str; 8] = [
        "MFX_IMPL_AUTO",
        "MFX_IMPL_SOFTWARE",
        "MFX_IMPL_HARDWARE",
        "MFX_IMPL_AUTO_ANY",
        "MFX_IMPL_HARDWARE_ANY",
        "MFX_IMPL_HARDWARE2",
        "MFX_IMPL_HARDWARE3",
        "MFX_IMPL_HARDWARE4",
    ];

    /// Renders an implementation selector, e.g. `MFX_IMPL_HARDWARE | MFX_IMPL_VIA_D3D11`.
    pub fn describe(value: u32) -> String {
        let base = (value & (VIA_ANY - 1)) as usize;
        let name = NAMES.get(base).copied().unwrap_or("MFX_IMPL_UNKNOWN");
        let via = match value & !(VIA_ANY - 1) {
            VIA_ANY => " | MFX_IMPL_VIA_ANY",
            VIA_D3D9 => " | MFX_IMPL_VIA_D3D9",
            VIA_D3D11 => " | MFX_IMPL_VIA_D3D11",
            _ => "",
        };
        format!("{}{}", name, via)
    }

    /// Quality tier names, indexed by target usage.
    pub fn describe_target_usage(usage: u32) -> String {
        match usage {
            0 => "MFX_TARGETUSAGE_UNKNOWN".to_string(),
            1 => "MFX_TARGETUSAGE_BEST_QUALITY".to_string(),
            4 => "MFX_TARGETUSAGE_BALANCED".to_string(),
            7 => "MFX_TARGETUSAGE_BEST_SPEED".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let req = InitRequest {
            mode: RequestMode::Encode,
            host_process_id: 77,
            fps: 30,
            keyint: 180,
            use_cbr: true,
            custom_impl: Some(ImplOverride {
                implementation: implementation::HARDWARE_ANY,
                interface: implementation::VIA_D3D11,
                version: Version::new(1, 6),
            }),
            ..Default::default()
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), InitRequest::SIZE);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[77, 0, 0, 0]);
        assert_eq!(InitRequest::decode(&bytes), req);

        let plain = InitRequest::default();
        assert_eq!(InitRequest::decode(&plain.to_bytes()).custom_impl, None);
    }

    #[test]
    fn test_version_compare() {
        assert!(Version::new(1, 6).at_least(1, 6));
        assert!(Version::new(2, 0).at_least(1, 6));
        assert!(!Version::new(1, 5).at_least(1, 6));
    }

    #[test]
    fn test_describe_impl() {
        assert_eq!(
            implementation::describe(implementation::HARDWARE | implementation::VIA_D3D11),
            "MFX_IMPL_HARDWARE | MFX_IMPL_VIA_D3D11"
        );
        assert_eq!(implementation::describe(0x0042), "MFX_IMPL_UNKNOWN");
        assert_eq!(implementation::describe_target_usage(4), "MFX_TARGETUSAGE_BALANCED");
        assert_eq!(implementation::describe_target_usage(3), "3");
    }

    #[test]
    fn test_ticks() {
        assert_eq!(ticks_from_ms(100), 9000);
        assert_eq!(ms_from_ticks(9089), 100);
    }
}
