//! Error types for the audio device layer, driver, and configuration

use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by a PCM device.
///
/// `Underrun`, `Suspended` and `WouldBlock` are transient conditions the
/// polling driver recovers from inline. Everything else is fatal once the
/// mixer is running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Can't open sound device '{name}': {reason}")]
    Open { name: String, reason: String },

    #[error("No audio output device available")]
    NoDevice,

    #[error("Can't {step} for sound: {reason}")]
    Negotiation { step: &'static str, reason: String },

    #[error("Sound output rate {actual} Hz doesn't match requested {requested} Hz")]
    RateMismatch { requested: u32, actual: u32 },

    #[error("Buffer underrun")]
    Underrun,

    #[error("Device suspended")]
    Suspended,

    #[error("Resource temporarily unavailable")]
    WouldBlock,

    #[error("Operation not supported by device")]
    NotSupported,

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Device is closed")]
    Closed,
}

impl DeviceError {
    /// Whether the polling driver may retry after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Underrun | Self::Suspended | Self::WouldBlock)
    }
}

/// Errors raised while starting, running, or stopping the sound mixer
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Can't recover sound from {action}: {source}")]
    Recovery {
        action: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("Sound write error: wrote {written} frames, expected {expected}")]
    ShortWrite { expected: usize, written: usize },

    #[error("Device has no async callback support and polling was disabled")]
    BackendUnavailable,

    #[error("Failed to spawn sound mixer thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("Sound mixer is not running")]
    AlreadyStopped,
}

/// Errors loading or saving [`crate::AudioConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
