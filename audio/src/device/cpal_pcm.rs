//! PCM device on top of cpal
//!
//! cpal only offers a pull-style callback, so a ring buffer sits between the
//! driver and the stream:
//!
//! ```text
//! Driver (polling thread or async handler)        cpal thread
//!     │                                                │
//! [mix period]──►[write_interleaved]──(ring)──►[data callback]──►device
//!     ▲                                                │
//!     └────────────(condvar: space available)──────────┘
//! ```
//!
//! In async mode the data callback runs the registered handler first, so
//! the handler tops up the ring right before it is drained.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig, SupportedBufferSize};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, warn};

use super::params::{CandidateConfig, HwParams, Negotiated, negotiate};
use super::{AsyncHandler, PcmDevice, PcmStream};
use crate::CHANNELS;
use crate::error::DeviceError;
use crate::mixer::FRAME_BYTES;

/// Ring size used when the host picks its own callback size, so a large
/// default callback still finds enough queued audio
const UNFIXED_RING_FRAMES: usize = 4096;

/// State shared between the cpal callback and write handles
struct CpalShared {
    producer: Mutex<HeapProd<i16>>,
    /// Set by the callback when it drained samples
    space: (Mutex<bool>, Condvar),
    handler: Mutex<Option<AsyncHandler>>,
    /// Ring ran dry while data was expected; cleared by `prepare`
    xrun: AtomicBool,
    /// Data has been written since the last `prepare`
    armed: AtomicBool,
    suspended: AtomicBool,
    closed: AtomicBool,
    callbacks: AtomicU64,
    callbacks_at_suspend: AtomicU64,
    /// Ring capacity in frames
    ring_frames: usize,
    /// Frames requested by the most recent callback, 0 before the first one
    callback_frames: AtomicUsize,
    /// How long a blocking write waits for space before giving up
    write_timeout: Duration,
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("{} mutex poisoned; continuing", what);
        e.into_inner()
    })
}

impl CpalShared {
    fn new(ring_frames: usize, write_timeout: Duration) -> (Arc<Self>, HeapCons<i16>) {
        let (producer, consumer) = HeapRb::<i16>::new(ring_frames * CHANNELS).split();
        let shared = Arc::new(Self {
            producer: Mutex::new(producer),
            space: (Mutex::new(false), Condvar::new()),
            handler: Mutex::new(None),
            xrun: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            callbacks: AtomicU64::new(0),
            callbacks_at_suspend: AtomicU64::new(0),
            ring_frames,
            callback_frames: AtomicUsize::new(0),
            write_timeout,
        });
        (shared, consumer)
    }

    fn check_state(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            Err(DeviceError::Closed)
        } else if self.suspended.load(Ordering::Acquire) {
            Err(DeviceError::Suspended)
        } else if self.xrun.load(Ordering::Acquire) {
            Err(DeviceError::Underrun)
        } else {
            Ok(())
        }
    }

    fn vacant_frames(&self) -> usize {
        lock_or_recover(&self.producer, "Ring producer").vacant_len() / CHANNELS
    }

    /// Push as many whole frames as fit without waiting
    fn push_frames(&self, bytes: &[u8]) -> usize {
        let offered = bytes.len() / FRAME_BYTES;
        let mut producer = lock_or_recover(&self.producer, "Ring producer");
        let frames = (producer.vacant_len() / CHANNELS).min(offered);
        if frames > 0 {
            producer.push_iter(
                bytes[..frames * FRAME_BYTES]
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]])),
            );
            self.armed.store(true, Ordering::Release);
        }
        frames
    }

    /// cpal data callback body
    fn on_callback(&self, consumer: &mut HeapCons<i16>, data: &mut [i16]) {
        self.callbacks.fetch_add(1, Ordering::AcqRel);

        let frames = data.len() / CHANNELS;
        if self.callback_frames.swap(frames, Ordering::AcqRel) != frames {
            debug!("Sound callback size: {} frames", frames);
            if frames > self.ring_frames {
                warn!(
                    "Sound callback wants {} frames but the ring holds {}",
                    frames, self.ring_frames
                );
            }
        }

        let has_handler = {
            let mut handler = lock_or_recover(&self.handler, "Async handler");
            if let Some(handler) = handler.as_mut() {
                handler(&mut RingIo { shared: self });
                true
            } else {
                false
            }
        };

        let popped = consumer.pop_slice(data);
        data[popped..].fill(0);

        // Async mode refills inside the callback; an empty ring there only
        // means the mixer has nothing queued yet
        if popped < data.len() && !has_handler && self.armed.load(Ordering::Acquire) {
            self.xrun.store(true, Ordering::Release);
        }

        let (lock, cvar) = &self.space;
        *lock_or_recover(lock, "Ring space") = true;
        cvar.notify_one();
    }

    fn on_error(&self, err: cpal::StreamError) {
        match err {
            cpal::StreamError::DeviceNotAvailable => {
                warn!("Sound device not available, suspending output");
                self.callbacks_at_suspend
                    .store(self.callbacks.load(Ordering::Acquire), Ordering::Release);
                self.suspended.store(true, Ordering::Release);
                self.space.1.notify_all();
            }
            other => error!("Audio stream error: {}", other),
        }
    }

    fn prepare(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }
        self.xrun.store(false, Ordering::Release);
        self.armed.store(false, Ordering::Release);
        self.suspended.store(false, Ordering::Release);
        Ok(())
    }

    /// The stream is back once the callback has run again after the suspend
    fn resume(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }
        if !self.suspended.load(Ordering::Acquire) {
            return Ok(());
        }
        let now = self.callbacks.load(Ordering::Acquire);
        if now > self.callbacks_at_suspend.load(Ordering::Acquire) {
            self.suspended.store(false, Ordering::Release);
            debug!("Sound device resumed");
            Ok(())
        } else {
            Err(DeviceError::WouldBlock)
        }
    }

    /// Fail every pending and future write with `Closed`
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space.1.notify_all();
    }
}

/// Non-blocking view of the ring handed to async handlers
struct RingIo<'a> {
    shared: &'a CpalShared,
}

impl PcmStream for RingIo<'_> {
    fn avail(&mut self) -> Result<usize, DeviceError> {
        self.shared.check_state()?;
        Ok(self.shared.vacant_frames())
    }

    fn write_interleaved(&mut self, bytes: &[u8]) -> Result<usize, DeviceError> {
        self.shared.check_state()?;
        match self.shared.push_frames(bytes) {
            0 if bytes.len() >= FRAME_BYTES => Err(DeviceError::WouldBlock),
            n => Ok(n),
        }
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        self.shared.prepare()
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        self.shared.resume()
    }
}

/// Blocking write handle, owned by the polling thread
pub struct CpalStream {
    shared: Arc<CpalShared>,
}

impl PcmStream for CpalStream {
    fn avail(&mut self) -> Result<usize, DeviceError> {
        self.shared.check_state()?;
        Ok(self.shared.vacant_frames())
    }

    fn write_interleaved(&mut self, bytes: &[u8]) -> Result<usize, DeviceError> {
        if bytes.len() < FRAME_BYTES {
            return Ok(0);
        }

        self.shared.check_state()?;
        let written = self.shared.push_frames(bytes);
        if written > 0 {
            return Ok(written);
        }

        // Ring is full: wait for the callback to drain some of it
        let (lock, cvar) = &self.shared.space;
        let guard = lock_or_recover(lock, "Ring space");
        let (mut drained, _) = cvar
            .wait_timeout_while(guard, self.shared.write_timeout, |drained| !*drained)
            .unwrap_or_else(|e| {
                warn!("Ring space mutex poisoned; continuing");
                e.into_inner()
            });
        *drained = false;
        drop(drained);

        self.shared.check_state()?;
        match self.shared.push_frames(bytes) {
            0 => Err(DeviceError::WouldBlock),
            n => Ok(n),
        }
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        self.shared.prepare()
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        self.shared.resume()
    }
}

/// Output device opened through cpal
pub struct CpalDevice {
    name: String,
    negotiated: Negotiated,
    shared: Arc<CpalShared>,
    /// The cpal stream (kept alive until close)
    stream: Option<cpal::Stream>,
    async_enabled: bool,
}

impl CpalDevice {
    /// Open and configure an output device
    ///
    /// `name` of `None` (or empty) selects the host default, falling back to
    /// the first output device the host lists.
    pub fn open(
        name: Option<&str>,
        params: &HwParams,
        async_enabled: bool,
    ) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = select_device(&host, name)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let candidates: Vec<CandidateConfig> = device
            .supported_output_configs()
            .map_err(|e| DeviceError::Negotiation {
                step: "get sound configuration space",
                reason: e.to_string(),
            })?
            .map(|range| CandidateConfig {
                channels: range.channels(),
                min_rate: range.min_sample_rate().0,
                max_rate: range.max_sample_rate().0,
                format: range.sample_format(),
                buffer_range: match range.buffer_size() {
                    SupportedBufferSize::Range { min, max } => Some((*min, *max)),
                    SupportedBufferSize::Unknown => None,
                },
            })
            .collect();

        let negotiated = negotiate(params, &candidates)?;
        debug!(
            "Sound device '{}': {} Hz, period {} frames, buffer {} frames{}",
            device_name,
            negotiated.rate,
            negotiated.period_frames,
            negotiated.buffer_frames,
            if negotiated.fixed_period { "" } else { " (period not fixed)" }
        );

        let config = StreamConfig {
            channels: params.channels,
            sample_rate: SampleRate(negotiated.rate),
            buffer_size: if negotiated.fixed_period {
                BufferSize::Fixed(negotiated.period_frames as u32)
            } else {
                BufferSize::Default
            },
        };

        // The host's own callback size is only known once it calls back,
        // so leave room for a large one
        let ring_frames = if negotiated.fixed_period {
            negotiated.buffer_frames
        } else {
            negotiated.buffer_frames.max(UNFIXED_RING_FRAMES)
        };
        let period = Duration::from_micros(
            negotiated.period_frames as u64 * 1_000_000 / negotiated.rate as u64,
        );
        let (shared, mut consumer) = CpalShared::new(ring_frames, period * 2);

        let data_shared = shared.clone();
        let error_shared = shared.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    data_shared.on_callback(&mut consumer, data);
                },
                move |err| error_shared.on_error(err),
                None,
            )
            .map_err(|e| DeviceError::Negotiation {
                step: "set hw params",
                reason: e.to_string(),
            })?;

        Ok(Self {
            name: device_name,
            negotiated,
            shared,
            stream: Some(stream),
            async_enabled,
        })
    }
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    match name.filter(|n| !n.is_empty()) {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| DeviceError::Open {
                name: wanted.to_string(),
                reason: e.to_string(),
            })?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| DeviceError::Open {
                name: wanted.to_string(),
                reason: "no such device".into(),
            }),
        None => {
            if let Some(device) = host.default_output_device() {
                return Ok(device);
            }
            debug!("No default sound device, trying the first listed output");
            host.output_devices()
                .map_err(|e| DeviceError::Open {
                    name: "default".into(),
                    reason: e.to_string(),
                })?
                .next()
                .ok_or(DeviceError::NoDevice)
        }
    }
}

impl PcmDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn stream(&mut self) -> Result<Box<dyn PcmStream>, DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::Closed);
        }
        Ok(Box::new(CpalStream {
            shared: self.shared.clone(),
        }))
    }

    fn register_async(&mut self, handler: AsyncHandler) -> Result<(), DeviceError> {
        if !self.async_enabled {
            return Err(DeviceError::NotSupported);
        }
        *lock_or_recover(&self.shared.handler, "Async handler") = Some(handler);
        Ok(())
    }

    fn unregister_async(&mut self) -> Result<(), DeviceError> {
        lock_or_recover(&self.shared.handler, "Async handler").take();
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream.as_ref().ok_or(DeviceError::Closed)?;
        stream
            .play()
            .map_err(|e| DeviceError::Stream(e.to_string()))?;
        debug!("Sound stream started on '{}'", self.name);
        Ok(())
    }

    fn close(&mut self) {
        self.shared.close();
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
        lock_or_recover(&self.shared.handler, "Async handler").take();
        debug!("Sound device '{}' closed", self.name);
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.close();
        }
    }
}
