use serde::{Deserialize, Serialize};

use crate::protocol::{ImplOverride, InitRequest, RequestMode, Version, implementation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorDescription {
    pub full_range: bool,
    pub matrix: u32,
    pub primaries: u32,
    pub transfer: u32,
}

/// Encoder session settings, handed to [`crate::session::Session::open`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Seconds between keyframes.
    pub keyframe_interval: u32,
    pub bframes: u32,
    /// kbps
    pub max_bitrate: u32,
    /// kbit
    pub buffer_size: u32,
    pub use_cbr: bool,
    pub use_cfr: bool,
    /// "high" or anything else for main.
    pub profile: String,
    pub color: ColorDescription,
    /// Whitespace separated `name=value` overrides, see [`CustomParams`].
    pub custom_params: Option<String>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            width: 1280,
            height: 720,
            keyframe_interval: 6,
            bframes: 7,
            max_bitrate: 3000,
            buffer_size: 3000,
            use_cbr: true,
            use_cfr: true,
            profile: "high".to_string(),
            color: ColorDescription::default(),
            custom_params: None,
        }
    }
}

impl EncoderSettings {
    /// Builds the full-session init request, applying any custom parameters.
    pub fn to_request(&self, host_process_id: u32) -> InitRequest {
        let mut keyint = self.fps * self.keyframe_interval;
        let mut bframes = self.bframes;
        let mut custom_impl = None;

        if let Some(params) = self.custom_params.as_deref() {
            let custom = CustomParams::parse(params);
            if !custom.is_empty() {
                log::info!("using custom encoder settings: \"{}\"", params.trim());
            }
            keyint = custom.keyint.unwrap_or(keyint);
            bframes = custom.bframes.unwrap_or(bframes);
            custom_impl = custom.implementation;
        }

        InitRequest {
            mode: RequestMode::Encode,
            host_process_id,
            fps: self.fps,
            keyint,
            bframes,
            width: self.width,
            height: self.height,
            max_bitrate: self.max_bitrate,
            buffer_size: self.buffer_size,
            use_cbr: self.use_cbr,
            main_profile: self.profile != "high",
            full_range: self.color.full_range,
            matrix: self.color.matrix,
            primaries: self.color.primaries,
            transfer: self.color.transfer,
            custom_impl,
        }
    }
}

/// Parsed custom encoder parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomParams {
    pub keyint: Option<u32>,
    pub bframes: Option<u32>,
    pub implementation: Option<ImplOverride>,
}

impl CustomParams {
    /// Parses `keyint=<n> bframes=<n> qsvimpl=<type>,<interface>,<major>.<minor>`.
    /// Unknown names and malformed values are skipped.
    pub fn parse(params: &str) -> Self {
        let mut out = Self::default();
        for token in params.split_whitespace() {
            let Some((name, value)) = token.split_once('=') else {
                continue;
            };
            match name {
                "keyint" => {
                    if let Ok(v) = value.parse::<u32>() {
                        out.keyint = Some(v);
                    }
                }
                "bframes" => {
                    if let Ok(v) = value.parse::<u32>() {
                        out.bframes = Some(v);
                    }
                }
                "qsvimpl" => {
                    if let Some(o) = parse_impl(value) {
                        out.implementation = Some(o);
                    }
                }
                _ => log::debug!("ignoring custom parameter {}", name),
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.keyint.is_none() && self.bframes.is_none() && self.implementation.is_none()
    }
}

fn parse_impl(value: &str) -> Option<ImplOverride> {
    let bits: Vec<&str> = value.split(',').map(str::trim).collect();
    if bits.len() < 3 {
        return None;
    }
    let (major, minor) = bits[2].split_once('.')?;
    let major = major.parse::<u16>().ok()?;
    let minor = minor.parse::<u16>().ok()?;

    let implementation = match bits[0].parse::<u32>().unwrap_or(0) {
        0 => implementation::HARDWARE_ANY,
        other => other,
    };
    let interface = match bits[1].to_ascii_lowercase().as_str() {
        "d3d11" => implementation::VIA_D3D11,
        "d3d9" => implementation::VIA_D3D9,
        _ => implementation::VIA_ANY,
    };
    Some(ImplOverride {
        implementation,
        interface,
        version: Version::new(major, minor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_custom_params() {
        let p = CustomParams::parse("keyint=120  bframes=2 qsvimpl=0,D3D11,1.6 foo=1 junk");
        assert_eq!(p.keyint, Some(120));
        assert_eq!(p.bframes, Some(2));
        assert_eq!(
            p.implementation,
            Some(ImplOverride {
                implementation: implementation::HARDWARE_ANY,
                interface: implementation::VIA_D3D11,
                version: Version::new(1, 6),
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        let p = CustomParams::parse("keyint=-5 bframes=x qsvimpl=2,d3d9 qsvimpl=2,d3d9,16");
        assert!(p.is_empty());
        let p = CustomParams::parse("qsvimpl=2,vaapi,1.3");
        assert_eq!(
            p.implementation.map(|o| (o.implementation, o.interface)),
            Some((implementation::HARDWARE, implementation::VIA_ANY))
        );
    }

    #[test]
    fn test_to_request() {
        let settings = EncoderSettings {
            fps: 25,
            keyframe_interval: 4,
            profile: "main".to_string(),
            ..Default::default()
        };
        let req = settings.to_request(9);
        assert_eq!(req.mode, RequestMode::Encode);
        assert_eq!(req.keyint, 100);
        assert_eq!(req.bframes, 7);
        assert!(req.main_profile);
        assert_eq!(req.custom_impl, None);

        let settings = EncoderSettings {
            custom_params: Some("keyint=50 qsvimpl=3,any,1.1".to_string()),
            ..Default::default()
        };
        let req = settings.to_request(9);
        assert_eq!(req.keyint, 50);
        assert!(!req.main_profile);
        assert_eq!(req.custom_impl.map(|o| o.implementation), Some(3));
    }

    #[test]
    fn test_settings_from_json() -> anyhow::Result<()> {
        let settings: EncoderSettings =
            serde_json::from_str(r#"{"fps": 60, "color": {"full_range": true}}"#)?;
        assert_eq!(settings.fps, 60);
        assert!(settings.color.full_range);
        assert_eq!(settings.bframes, 7);
        Ok(())
    }
}
