//! Callback-driven backend
//!
//! The device calls back whenever it has room; each call mixes and submits
//! whole periods until less than one period of space is left.

use tracing::{debug, trace};

use crate::device::{AsyncHandler, PcmDevice, PcmStream};
use crate::error::{DeviceError, DriverError};
use crate::mixer::{FRAME_BYTES, Mixer, PeriodBuffers};

use super::metrics::DriverMetrics;
use super::{AudioBackend, BackendKind, fatal};

/// Per-handler state moved into the device callback
pub(crate) struct CallbackState {
    pub(super) mixer: Mixer,
    buffers: PeriodBuffers,
    pub(super) metrics: DriverMetrics,
}

impl CallbackState {
    pub(crate) fn new(mixer: Mixer, period_frames: usize) -> Self {
        Self {
            mixer,
            buffers: PeriodBuffers::new(period_frames),
            metrics: DriverMetrics::new(),
        }
    }

    /// Fill the device while it has room for a full period
    pub(crate) fn service(&mut self, io: &mut dyn PcmStream) -> Result<(), DriverError> {
        let period = self.buffers.period_frames();
        // At most one recovery per callback; a device that keeps failing
        // is retried on the next one
        let mut recovered = false;
        while !self.mixer.is_shutting_down() {
            match io.avail() {
                Ok(frames) if frames >= period => {}
                Ok(_) => break,
                Err(DeviceError::Underrun | DeviceError::Suspended) if recovered => break,
                Err(DeviceError::Underrun) => {
                    recovered = true;
                    debug!("Sound underrun in callback, preparing device");
                    io.prepare().map_err(|source| DriverError::Recovery {
                        action: "underrun",
                        source,
                    })?;
                    self.metrics.underruns += 1;
                    continue;
                }
                Err(DeviceError::Suspended) => {
                    recovered = true;
                    if !self.recover_suspend(io)? {
                        break;
                    }
                    continue;
                }
                Err(DeviceError::WouldBlock) => {
                    trace!("Sound callback skipped: device busy");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            self.mixer.mix_period(&mut self.buffers);
            self.metrics.record_mix(self.buffers.last_mix_us());

            let written = io.write_interleaved(self.buffers.output())?;
            if written != period {
                return Err(DriverError::ShortWrite {
                    expected: period,
                    written,
                });
            }
        }
        self.metrics.maybe_log();
        Ok(())
    }

    /// Single resume attempt; "not yet" leaves it to the next callback.
    /// A failed resume falls back to prepare.
    ///
    /// Returns true once the device is usable again.
    fn recover_suspend(&mut self, io: &mut dyn PcmStream) -> Result<bool, DriverError> {
        match io.resume() {
            Ok(()) => {}
            Err(DeviceError::WouldBlock) => {
                trace!("Sound device still suspended");
                return Ok(false);
            }
            Err(e) => {
                debug!("Resume failed ({}), preparing device", e);
                io.prepare().map_err(|source| DriverError::Recovery {
                    action: "suspend",
                    source,
                })?;
            }
        }
        self.metrics.suspends += 1;
        Ok(true)
    }
}

/// Async handler registered with the device
pub(super) struct CallbackBackend;

impl CallbackBackend {
    /// Register the handler, queue `prime_periods` of silence and start the
    /// device.
    ///
    /// Returns `None` when the device has no async support.
    pub(super) fn start(
        device: &mut dyn PcmDevice,
        mixer: Mixer,
        prime_periods: u32,
    ) -> Result<Option<Self>, DriverError> {
        let period = device.negotiated().period_frames;
        let mut state = CallbackState::new(mixer, period);
        let handler: AsyncHandler = Box::new(move |io: &mut dyn PcmStream| {
            if let Err(e) = state.service(io) {
                fatal(&e);
            }
        });

        match device.register_async(handler) {
            Ok(()) => {}
            Err(DeviceError::NotSupported) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        // Never queue more than the device buffer holds before it starts
        let fits = (device.negotiated().buffer_frames / period.max(1)) as u32;
        let primes = prime_periods.min(fits);

        let mut stream = device.stream()?;
        let mut silence = PeriodBuffers::new(period);
        let silence = silence.silence();
        for _ in 0..primes {
            let written = stream.write_interleaved(silence)?;
            if written * FRAME_BYTES != silence.len() {
                return Err(DriverError::ShortWrite {
                    expected: period,
                    written,
                });
            }
        }

        device.start()?;
        debug!("Sound mixer running on async callback ({} primed periods)", primes);
        Ok(Some(Self))
    }
}

impl AudioBackend for CallbackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Callback
    }

    fn stop(&mut self, device: &mut dyn PcmDevice) -> Result<(), DriverError> {
        device.unregister_async()?;
        Ok(())
    }
}
