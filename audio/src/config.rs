//! Audio configuration (audio.toml)
//!
//! Every field has a default, so a partial or missing file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::HwParams;
use crate::device::params::{DEFAULT_BUFFER_TIME_US, DEFAULT_PERIOD_TIME_US};
use crate::error::ConfigError;
use crate::mixer::DEFAULT_MASTER_VOLUME;

/// How the driver feeds the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Async callback if the device supports it, otherwise a polling thread
    #[default]
    Auto,
    /// Async callback only; startup fails without device support
    Callback,
    /// Always use a dedicated polling thread
    Polling,
}

/// Sound mixer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Output device name (default: system default)
    #[serde(default)]
    pub output_device: Option<String>,
    /// Initial master volume (default: 0.7)
    #[serde(default = "default_master_volume")]
    pub master_volume: f32,
    /// Target device buffer time in microseconds (default: 50ms)
    #[serde(default = "default_buffer_time_us")]
    pub buffer_time_us: u32,
    /// Target period time in microseconds (default: 10ms)
    #[serde(default = "default_period_time_us")]
    pub period_time_us: u32,
    /// Driver strategy (default: auto)
    #[serde(default)]
    pub backend: BackendMode,
    /// Sleep between resume attempts while the device is suspended
    #[serde(default = "default_resume_retry_ms")]
    pub resume_retry_ms: u64,
    /// Silent periods queued before starting in callback mode (default: 3)
    #[serde(default = "default_prime_periods")]
    pub prime_periods: u32,
}

fn default_master_volume() -> f32 {
    DEFAULT_MASTER_VOLUME
}
fn default_buffer_time_us() -> u32 {
    DEFAULT_BUFFER_TIME_US
}
fn default_period_time_us() -> u32 {
    DEFAULT_PERIOD_TIME_US
}
fn default_resume_retry_ms() -> u64 {
    1000
}
fn default_prime_periods() -> u32 {
    3
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_device: None,
            master_volume: default_master_volume(),
            buffer_time_us: default_buffer_time_us(),
            period_time_us: default_period_time_us(),
            backend: BackendMode::default(),
            resume_retry_ms: default_resume_retry_ms(),
            prime_periods: default_prime_periods(),
        }
    }
}

impl AudioConfig {
    /// Hardware parameters to request from the device
    pub fn hw_params(&self) -> HwParams {
        HwParams::with_times(self.buffer_time_us, self.period_time_us)
    }

    pub fn resume_retry_interval(&self) -> Duration {
        Duration::from_millis(self.resume_retry_ms)
    }

    /// Platform config file location
    ///
    /// On Linux: `~/.config/frostbyte/audio.toml`
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "frostbyte", "frostbyte")
            .map(|dirs| dirs.config_dir().join("audio.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the config, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the platform config path. A missing file gives defaults; a
    /// broken one is logged and replaced by defaults.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            warn!("{}; using default audio settings", e);
            Self::default()
        })
    }

    /// The configured device name, treating an empty string as "default"
    pub fn device_name(&self) -> Option<&str> {
        self.output_device.as_deref().filter(|name| !name.is_empty())
    }
}
