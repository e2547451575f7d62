use std::path::{Path, PathBuf};

use qsv_bridge::{CpuPlatform, EncoderSettings};
use serde::{Deserialize, Serialize};

/// External helper executable, talked to through mapped files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Defaults to `qsv-bridge` under the system temp dir.
    pub object_dir: Option<PathBuf>,
}

impl HelperConfig {
    pub fn object_dir(&self) -> PathBuf {
        self.object_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("qsv-bridge"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub encoder: EncoderSettings,
    /// Overrides cpu detection.
    pub platform: Option<CpuPlatform>,
    /// Run the hardware probe before opening the session.
    pub probe: bool,
    /// Synthetic frames pushed through the session.
    pub frames: u32,
    /// Without a helper the session runs against the in-process simulation.
    pub helper: Option<HelperConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderSettings::default(),
            platform: None,
            probe: true,
            frames: 90,
            helper: None,
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn platform(&self) -> CpuPlatform {
        self.platform.unwrap_or_else(CpuPlatform::detect)
    }
}
