//! Recognized configuration options.
//!
//! A small TOML surface with every field individually defaulted, resolved
//! from the following locations (in order of priority):
//!
//! 1. `USBLINK_CONFIG` environment variable (explicit path)
//! 2. `./usblink.toml` (current directory)
//! 3. The platform config directory (XDG on Linux/macOS, `%APPDATA%` on
//!    Windows)
//! 4. Built-in defaults (no file required)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::error::SessionError;
use crate::params::{DataBits, SerialParameters};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1000;

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> String {
    "1".into()
}

fn default_parity() -> String {
    "none".into()
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_write_timeout() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

/// Errors while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// The recognized options, raw form. Conversion into [`SerialParameters`]
/// is where invalid values are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_baud")]
    pub baud_rate: u32,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// `"1"`, `"1.5"` or `"2"`.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: String,

    /// `none`, `odd`, `even`, `mark` or `space`.
    #[serde(default = "default_parity")]
    pub parity: String,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl SessionConfig {
    /// Load from the resolved config path, or defaults when no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        match resolve_config_path() {
            Some(path) => {
                debug!(path = %path.display(), "loading configuration");
                Self::from_path(&path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Convert into validated serial parameters.
    pub fn serial_parameters(&self) -> Result<SerialParameters, SessionError> {
        let params = SerialParameters {
            baud_rate: self.baud_rate,
            data_bits: DataBits::try_from(self.data_bits)?,
            stop_bits: self.stop_bits.parse()?,
            parity: self.parity.parse()?,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Resolve the active config file path, if any exists.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("USBLINK_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    let local = PathBuf::from("usblink.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(dirs) = directories::ProjectDirs::from("", "", "usblink") {
        let candidate = dirs.config_dir().join("usblink.toml");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
