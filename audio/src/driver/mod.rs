//! Sound mixer driver
//!
//! Opens the output device, chooses how to feed it, and owns the lifecycle:
//!
//! ```text
//! Closed -> Configuring -> Running -> Stopping -> Closed
//! ```
//!
//! Two backends exist. The callback backend registers an async handler with
//! the device and mixes from inside the device's own thread. The polling
//! backend runs a dedicated "sound-mixer" thread that mixes and writes with
//! blocking I/O. With [`BackendMode::Auto`] the callback backend is tried
//! first and the polling thread is used when the device reports no async
//! support.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::{AudioConfig, BackendMode};
use crate::device::{CpalDevice, Negotiated, PcmDevice};
use crate::error::DriverError;
use crate::mixer::Mixer;
use crate::sound::{SampleSource, SourceRef};

mod callback;
mod metrics;
mod polling;

#[cfg(test)]
mod tests;

use callback::CallbackBackend;
use polling::PollingBackend;

/// Lifecycle of a [`SoundMixer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Closed,
    Configuring,
    Running,
    Stopping,
}

/// Which strategy is feeding the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Mixing inside the device's async callback
    Callback,
    /// Mixing on a dedicated thread with blocking writes
    Polling,
}

/// A running way of feeding the device
trait AudioBackend {
    fn kind(&self) -> BackendKind;

    /// Stop producing audio. The mixer's shutdown flag is already set.
    fn stop(&mut self, device: &mut dyn PcmDevice) -> Result<(), DriverError>;
}

/// Report an unrecoverable sound error and terminate the process
///
/// Used once audio is running, where there is no caller to hand the error
/// back to.
pub fn fatal(err: &dyn std::error::Error) -> ! {
    error!("Fatal sound error: {}", err);
    let mut source = err.source();
    while let Some(cause) = source {
        error!("  caused by: {}", cause);
        source = cause.source();
    }
    std::process::abort()
}

/// The sound mixer: shared mixing state plus the device and backend feeding it
///
/// The device handle is owned by the thread that started the mixer, so this
/// type is not `Send`. Use [`SoundMixer::mixer`] to get a handle that can
/// move between threads.
pub struct SoundMixer {
    mixer: Mixer,
    device: Box<dyn PcmDevice>,
    backend: Option<Box<dyn AudioBackend>>,
    state: DriverState,
}

impl SoundMixer {
    /// Open the configured output device and start mixing
    pub fn start(config: &AudioConfig) -> Result<Self, DriverError> {
        let async_enabled = config.backend != BackendMode::Polling;
        let device = CpalDevice::open(config.device_name(), &config.hw_params(), async_enabled)?;
        Self::start_with_device(Box::new(device), config)
    }

    /// Like [`SoundMixer::start`], but any failure is fatal
    pub fn start_or_abort(config: &AudioConfig) -> Self {
        match Self::start(config) {
            Ok(mixer) => mixer,
            Err(e) => fatal(&e),
        }
    }

    /// Start mixing into an already opened device
    pub fn start_with_device(
        mut device: Box<dyn PcmDevice>,
        config: &AudioConfig,
    ) -> Result<Self, DriverError> {
        debug!("Sound mixer state: {:?}", DriverState::Configuring);
        let mixer = Mixer::new(config.master_volume);

        let backend = match start_backend(device.as_mut(), &mixer, config) {
            Ok(backend) => backend,
            Err(e) => {
                mixer.request_shutdown();
                device.close();
                return Err(e);
            }
        };

        let negotiated = device.negotiated();
        info!(
            "Sound mixer started on '{}' ({:?}, period {} frames, buffer {} frames)",
            device.name(),
            backend.kind(),
            negotiated.period_frames,
            negotiated.buffer_frames
        );
        debug!("Sound mixer state: {:?}", DriverState::Running);

        Ok(Self {
            mixer,
            device,
            backend: Some(backend),
            state: DriverState::Running,
        })
    }

    /// Cloneable handle to the mixing state
    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    pub fn play(&self, source: SourceRef, volume: f32) {
        self.mixer.play(source, volume);
    }

    pub fn stop<S: SampleSource + ?Sized>(&self, source: &Arc<S>) {
        self.mixer.stop(source);
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.mixer.set_master_volume(volume);
    }

    pub fn master_volume(&self) -> f32 {
        self.mixer.master_volume()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Backend in use, `None` once shut down
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn negotiated(&self) -> Negotiated {
        self.device.negotiated()
    }

    /// Stop mixing and close the device
    ///
    /// Blocks until the mixing thread (if any) has exited.
    pub fn shutdown(&mut self) -> Result<(), DriverError> {
        if self.state != DriverState::Running {
            return Err(DriverError::AlreadyStopped);
        }
        self.set_state(DriverState::Stopping);
        self.mixer.request_shutdown();

        let result = match self.backend.take() {
            Some(mut backend) => backend.stop(self.device.as_mut()),
            None => Ok(()),
        };

        self.device.close();
        self.set_state(DriverState::Closed);
        info!("Sound mixer stopped");
        result
    }

    fn set_state(&mut self, state: DriverState) {
        debug!("Sound mixer state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

impl Drop for SoundMixer {
    fn drop(&mut self) {
        if self.state == DriverState::Running
            && let Err(e) = self.shutdown()
        {
            error!("Sound mixer shutdown failed: {}", e);
        }
    }
}

/// Pick and start a backend according to `config.backend`
fn start_backend(
    device: &mut dyn PcmDevice,
    mixer: &Mixer,
    config: &AudioConfig,
) -> Result<Box<dyn AudioBackend>, DriverError> {
    if config.backend != BackendMode::Polling {
        if let Some(backend) = CallbackBackend::start(device, mixer.clone(), config.prime_periods)? {
            return Ok(Box::new(backend));
        }
        if config.backend == BackendMode::Callback {
            return Err(DriverError::BackendUnavailable);
        }
        debug!(
            "Device '{}' has no async callback support, using polling thread",
            device.name()
        );
    }

    device.start()?;
    let backend = PollingBackend::spawn(device, mixer.clone(), config.resume_retry_interval())?;
    Ok(Box::new(backend))
}
