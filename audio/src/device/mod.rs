//! PCM device abstraction
//!
//! The driver talks to hardware through two traits:
//! - [`PcmDevice`] is the device itself, owned by the thread that opened it
//!   (cpal streams are not `Send`)
//! - [`PcmStream`] is the write side, `Send` so the polling thread can own it
//!
//! Error semantics follow the usual PCM conventions: a write may fail with
//! `Underrun` (call `prepare`), `Suspended` (call `resume`, falling back to
//! `prepare`) or `WouldBlock` (retry).

mod cpal_pcm;
mod enumerate;
pub mod params;

pub use cpal_pcm::CpalDevice;
pub use enumerate::{DeviceInfo, enumerate_devices};
pub use params::{CandidateConfig, HwParams, Negotiated, negotiate};

use crate::error::DeviceError;

/// Write side of an open PCM device
pub trait PcmStream: Send {
    /// Frames that can be written right now without blocking
    fn avail(&mut self) -> Result<usize, DeviceError>;

    /// Write interleaved little-endian s16 frames.
    ///
    /// Returns the number of whole frames accepted, which may be fewer than
    /// offered. The blocking variant waits for space; `WouldBlock` means no
    /// space appeared in time.
    fn write_interleaved(&mut self, bytes: &[u8]) -> Result<usize, DeviceError>;

    /// Recover from an underrun (or a failed resume)
    fn prepare(&mut self) -> Result<(), DeviceError>;

    /// Try to resume after a suspend. `WouldBlock` means "not yet".
    fn resume(&mut self) -> Result<(), DeviceError>;
}

/// Handler invoked from the device's own thread whenever it wants data
pub type AsyncHandler = Box<dyn FnMut(&mut dyn PcmStream) + Send>;

/// An opened, configured PCM output device
pub trait PcmDevice {
    fn name(&self) -> &str;

    /// Period and buffer sizes granted at open time
    fn negotiated(&self) -> Negotiated;

    /// Blocking write handle
    fn stream(&mut self) -> Result<Box<dyn PcmStream>, DeviceError>;

    /// Register an async handler. `NotSupported` means the device can only
    /// be driven by a polling thread.
    fn register_async(&mut self, handler: AsyncHandler) -> Result<(), DeviceError>;

    fn unregister_async(&mut self) -> Result<(), DeviceError>;

    /// Start playback of whatever has been queued
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Close the device; pending audio is discarded
    fn close(&mut self);
}
