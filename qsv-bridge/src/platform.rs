//! Coarse CPU platform classification.
//!
//! Only the generations that change encoder behaviour are distinguished:
//! Sandy Bridge and Ivy Bridge cap the output resolution, Haswell and later
//! emit pyramid B-frames. Later generations classify as [`CpuPlatform::Haswell`].

use serde::{Deserialize, Serialize};

use crate::error::EncoderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuPlatform {
    #[default]
    Unknown,
    SandyBridge,
    IvyBridge,
    Haswell,
}

impl CpuPlatform {
    /// Classifies a display family/model pair (Intel SDM Vol. 3C, table 35-1).
    pub fn classify(family: u32, model: u32) -> Self {
        if family != 6 {
            return CpuPlatform::Unknown;
        }
        match model {
            0x2a | 0x2d => CpuPlatform::SandyBridge,
            0x3a | 0x3e => CpuPlatform::IvyBridge,
            0x3c | 0x3d | 0x45 | 0x46 | 0x47 => CpuPlatform::Haswell,
            // anything numbered past Ivy Bridge is a later generation
            m if m > 0x3e => CpuPlatform::Haswell,
            _ => CpuPlatform::Unknown,
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86")]
        use std::arch::x86::__cpuid;
        #[cfg(target_arch = "x86_64")]
        use std::arch::x86_64::__cpuid;

        #[allow(unused_unsafe)]
        let eax = unsafe { __cpuid(1) }.eax;
        let model = ((eax >> 4) & 0xf) + ((eax >> 12) & 0xf0);
        let family = ((eax >> 8) & 0xf) + ((eax >> 20) & 0xff);
        let platform = Self::classify(family, model);
        log::debug!(
            "cpu family {:#x} model {:#x} classified as {:?}",
            family,
            model,
            platform
        );
        platform
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    pub fn detect() -> Self {
        CpuPlatform::Unknown
    }

    /// Whether the hardware produces pyramid-structured B-frames.
    pub fn has_pyramid_bframes(&self) -> bool {
        *self >= CpuPlatform::Haswell
    }

    /// Rejects output sizes the platform's encoder cannot handle.
    pub fn check_resolution(&self, width: u32, height: u32) -> Result<(), EncoderError> {
        let limited = matches!(self, CpuPlatform::SandyBridge | CpuPlatform::IvyBridge);
        if limited && (width > 1920 || height > 1200) {
            log::error!(
                "output resolution of {}x{} exceeds the maximum of 1920x1200 supported on {:?}",
                width,
                height,
                self
            );
            return Err(EncoderError::ResolutionUnsupported { width, height });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(CpuPlatform::classify(6, 0x2a), CpuPlatform::SandyBridge);
        assert_eq!(CpuPlatform::classify(6, 0x3e), CpuPlatform::IvyBridge);
        assert_eq!(CpuPlatform::classify(6, 0x45), CpuPlatform::Haswell);
        // Broadwell, Skylake, Kaby Lake, Alder Lake
        for model in [0x3d, 0x4e, 0x5e, 0x9e, 0x97] {
            assert_eq!(CpuPlatform::classify(6, model), CpuPlatform::Haswell);
            assert!(CpuPlatform::classify(6, model).has_pyramid_bframes());
        }
        // Nehalem, Westmere predate the encoder
        assert_eq!(CpuPlatform::classify(6, 0x1a), CpuPlatform::Unknown);
        assert_eq!(CpuPlatform::classify(6, 0x2c), CpuPlatform::Unknown);
        assert_eq!(CpuPlatform::classify(0x17, 0x3c), CpuPlatform::Unknown);
    }

    #[test]
    fn test_pyramid() {
        assert!(CpuPlatform::Haswell.has_pyramid_bframes());
        assert!(!CpuPlatform::IvyBridge.has_pyramid_bframes());
        assert!(!CpuPlatform::Unknown.has_pyramid_bframes());
    }

    #[test]
    fn test_resolution_limit() {
        assert!(CpuPlatform::IvyBridge.check_resolution(1920, 1200).is_ok());
        assert!(CpuPlatform::IvyBridge.check_resolution(2560, 1080).is_err());
        assert!(CpuPlatform::SandyBridge.check_resolution(1280, 1440).is_err());
        assert!(CpuPlatform::Haswell.check_resolution(3840, 2160).is_ok());
        assert!(CpuPlatform::Unknown.check_resolution(3840, 2160).is_ok());
    }
}
