//! Frostbyte audio - software sound mixer
//!
//! Mixes any number of concurrently playing sounds into one 16-bit stereo
//! stream at 44.1 kHz and keeps the output device fed, either from the
//! device's async callback or from a dedicated polling thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use frostbyte_audio::{AudioConfig, Sound, SoundMixer};
//!
//! let mut mixer = SoundMixer::start(&AudioConfig::load_or_default())?;
//! let beep = Arc::new(Sound::sine(440.0, 0.5, 0.5));
//! mixer.play(beep.clone(), 1.0);
//! mixer.shutdown()?;
//! # Ok::<(), frostbyte_audio::DriverError>(())
//! ```

pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod mixer;
pub mod sound;

/// Output sample rate in Hz
pub const SAMPLE_RATE: u32 = 44_100;

/// Output channels (interleaved stereo)
pub const CHANNELS: usize = 2;

pub use config::{AudioConfig, BackendMode};
pub use device::{DeviceInfo, enumerate_devices};
pub use driver::{BackendKind, DriverState, SoundMixer, fatal};
pub use error::{ConfigError, DeviceError, DriverError};
pub use mixer::{Mixer, PeriodBuffers};
pub use sound::{PlayCounter, SampleSource, Sound, SourceRef};
