//! Marshalling Configuration
//!
//! Handles parsing and management of nativecall.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// File name searched for by [`MarshalConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "nativecall.toml";

/// Root configuration structure matching nativecall.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MarshalConfig {
    /// Library lookup
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Decode limits
    #[serde(default)]
    pub decode: DecodeConfig,

    /// Callback thunk pool
    #[serde(default)]
    pub callbacks: CallbackConfig,
}

impl MarshalConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: MarshalConfig = toml::from_str(&content)?;
        log::debug!("[config] loaded {}", path.display());
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Library search settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoaderConfig {
    /// Extra directories searched before the platform defaults
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Append the platform's standard library directories
    #[serde(default = "default_true")]
    pub include_default_paths: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            include_default_paths: true,
        }
    }
}

/// Bounds applied while decoding native memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecodeConfig {
    /// Pointer hops followed before a pointer is left as a raw address
    #[serde(default = "default_max_pointer_depth")]
    pub max_pointer_depth: usize,

    /// Longest NUL-terminated string scanned through a pointer, in units
    #[serde(default = "default_max_string_units")]
    pub max_string_units: usize,
}

fn default_max_pointer_depth() -> usize {
    8
}

fn default_max_string_units() -> usize {
    32767
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_pointer_depth: default_max_pointer_depth(),
            max_string_units: default_max_string_units(),
        }
    }
}

/// Callback registration settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackConfig {
    /// Callbacks a single registry may hold at once
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,
}

fn default_max_slots() -> usize {
    crate::ffi::CALLBACK_SLOTS
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_slots: default_max_slots(),
        }
    }
}
