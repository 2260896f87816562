// src/config.rs

//! Engine and trigger configuration
//!
//! Configuration is a JSON document; every field is optional and falls back
//! to the defaults below.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root the transaction operates under
    pub offset: String,
    /// Parent directory for the engine's scratch directory
    pub tempdir: Option<PathBuf>,
    /// Worker threads for threaded triggers (defaults to available cores)
    pub parallelism: Option<usize>,
    /// Register only the merge and unmerge triggers
    pub disable_plugins: bool,
    pub triggers: TriggerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            offset: "/".to_string(),
            tempdir: None,
            parallelism: None,
            disable_plugins: false,
            triggers: TriggerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default configuration operating under `offset`
    pub fn with_offset(offset: impl Into<String>) -> Self {
        Self {
            offset: offset.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Worker count for threaded triggers, at least one
    pub fn worker_count(&self) -> usize {
        self.parallelism
            .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
            .unwrap_or(1)
            .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorldWritable {
    Ignore,
    Warn,
    Fix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StripMode {
    None,
    Strip,
    Split,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdConfigSettings {
    pub enabled: bool,
    pub binary: PathBuf,
    /// Relative to the offset
    pub ld_so_conf: String,
}

impl Default for LdConfigSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: PathBuf::from("/sbin/ldconfig"),
            ld_so_conf: "etc/ld.so.conf".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoRegenSettings {
    pub enabled: bool,
    pub dirs: Vec<String>,
}

impl Default for InfoRegenSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dirs: vec!["/usr/share/info".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StripSettings {
    pub mode: StripMode,
    pub strip_binary: Option<PathBuf>,
    pub objcopy_binary: Option<PathBuf>,
    pub debug_storage: String,
}

impl Default for StripSettings {
    fn default() -> Self {
        Self {
            mode: StripMode::None,
            strip_binary: None,
            objcopy_binary: None,
            debug_storage: "/usr/lib/debug".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Owner used while building; remapped to `owner_uid`/`owner_gid`
    pub build_uid: Option<u32>,
    pub build_gid: Option<u32>,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub fix_set_bits: bool,
    pub world_writable: WorldWritable,
    pub common_directory_modes: bool,
    /// Paths (and everything below them) dropped before merging
    pub install_mask: Vec<String>,
    /// Paths never removed by an unmerge
    pub protected_paths: Vec<String>,
    pub ldconfig: LdConfigSettings,
    pub info_regen: InfoRegenSettings,
    pub strip: StripSettings,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            build_uid: None,
            build_gid: None,
            owner_uid: 0,
            owner_gid: 0,
            fix_set_bits: true,
            world_writable: WorldWritable::Warn,
            common_directory_modes: true,
            install_mask: Vec::new(),
            protected_paths: [
                "/usr",
                "/usr/lib",
                "/usr/lib64",
                "/usr/lib32",
                "/usr/bin",
                "/usr/sbin",
                "/bin",
                "/sbin",
                "/lib",
                "/lib32",
                "/lib64",
                "/etc",
                "/var",
                "/home",
                "/root",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            ldconfig: LdConfigSettings::default(),
            info_regen: InfoRegenSettings::default(),
            strip: StripSettings::default(),
        }
    }
}
