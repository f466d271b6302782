//! Polling-thread backend
//!
//! Used when the device has no async callback support. A dedicated thread
//! mixes one period at a time and pushes it through the blocking write,
//! recovering inline from underrun, suspend and "try again".

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::{PcmDevice, PcmStream};
use crate::error::{DeviceError, DriverError};
use crate::mixer::{FRAME_BYTES, Mixer, PeriodBuffers};

use super::metrics::DriverMetrics;
use super::{AudioBackend, BackendKind, fatal};

/// Mixing loop state owned by the polling thread
pub(crate) struct PollingLoop {
    mixer: Mixer,
    buffers: PeriodBuffers,
    resume_retry: Duration,
    pub(super) metrics: DriverMetrics,
}

impl PollingLoop {
    pub(crate) fn new(mixer: Mixer, period_frames: usize, resume_retry: Duration) -> Self {
        Self {
            mixer,
            buffers: PeriodBuffers::new(period_frames),
            resume_retry,
            metrics: DriverMetrics::new(),
        }
    }

    /// Mix and write periods until shutdown is requested
    pub(crate) fn run(&mut self, stream: &mut dyn PcmStream) -> Result<(), DriverError> {
        debug!("Sound mixer thread started");
        while !self.mixer.is_shutting_down() {
            self.step(stream)?;
            self.metrics.maybe_log();
        }
        debug!("Sound mixer thread finished");
        Ok(())
    }

    /// Mix one period and write all of it
    pub(crate) fn step(&mut self, stream: &mut dyn PcmStream) -> Result<(), DriverError> {
        self.mixer.mix_period(&mut self.buffers);
        self.metrics.record_mix(self.buffers.last_mix_us());
        self.write_period(stream)
    }

    /// Write the current period, handling partial writes and recoverable
    /// device errors. Anything else is returned as fatal.
    fn write_period(&mut self, stream: &mut dyn PcmStream) -> Result<(), DriverError> {
        let total = self.buffers.output().len();
        let mut offset = 0;

        while offset < total {
            let result = stream.write_interleaved(&self.buffers.output()[offset..]);
            match result {
                Ok(frames) => offset += frames * FRAME_BYTES,
                Err(DeviceError::WouldBlock) => {
                    self.metrics.retries += 1;
                    if self.mixer.is_shutting_down() {
                        return Ok(());
                    }
                }
                Err(DeviceError::Underrun) => {
                    debug!("Sound underrun, preparing device");
                    stream.prepare().map_err(|source| DriverError::Recovery {
                        action: "underrun",
                        source,
                    })?;
                    self.metrics.underruns += 1;
                }
                Err(DeviceError::Suspended) => {
                    if !self.recover_suspend(stream)? {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Resume after a suspend, retrying while the device says "not yet" and
    /// preparing if resume fails outright.
    ///
    /// Returns false if shutdown was requested while waiting.
    fn recover_suspend(&mut self, stream: &mut dyn PcmStream) -> Result<bool, DriverError> {
        warn!("Sound device suspended, waiting to resume");
        let resumed = loop {
            match stream.resume() {
                Err(DeviceError::WouldBlock) => {
                    if self.mixer.is_shutting_down() {
                        return Ok(false);
                    }
                    thread::sleep(self.resume_retry);
                }
                other => break other,
            }
        };

        if let Err(e) = resumed {
            debug!("Resume failed ({}), preparing device", e);
            stream.prepare().map_err(|source| DriverError::Recovery {
                action: "suspend",
                source,
            })?;
        }
        self.metrics.suspends += 1;
        Ok(true)
    }
}

/// Dedicated mixing thread feeding a blocking stream
pub(super) struct PollingBackend {
    handle: Option<JoinHandle<()>>,
}

impl PollingBackend {
    pub(super) fn spawn(
        device: &mut dyn PcmDevice,
        mixer: Mixer,
        resume_retry: Duration,
    ) -> Result<Self, DriverError> {
        let mut stream = device.stream()?;
        let mut looper = PollingLoop::new(mixer, device.negotiated().period_frames, resume_retry);

        let handle = thread::Builder::new()
            .name("sound-mixer".into())
            .spawn(move || {
                if let Err(e) = looper.run(stream.as_mut()) {
                    fatal(&e);
                }
            })
            .map_err(DriverError::ThreadSpawn)?;

        Ok(Self {
            handle: Some(handle),
        })
    }
}

impl AudioBackend for PollingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Polling
    }

    fn stop(&mut self, _device: &mut dyn PcmDevice) -> Result<(), DriverError> {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Sound mixer thread panicked");
        }
        Ok(())
    }
}
