//! Shared mixer state and the playback control API
//!
//! Architecture:
//! - `Mixer` is a cheap, cloneable handle to the one mutex-protected state
//! - Game threads call `play`/`stop`/`set_master_volume` at any time
//! - The driver thread (or device callback) calls `mix_period` once per period
//!
//! The mutex is held only while the slot list is read or changed. Output
//! formatting and device writes happen outside it, so callers never wait on
//! device timing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::sound::{SampleSource, SourceRef};

mod mix;


pub use mix::{FRAME_BYTES, PeriodBuffers};

/// Master volume used when nothing else is configured
pub const DEFAULT_MASTER_VOLUME: f32 = 0.7;

/// One playing instance of a source
pub struct PlaybackSlot {
    pub(crate) source: SourceRef,
    /// Per-slot gain. Not clamped: values above 1.0 amplify.
    pub(crate) volume: f32,
    /// Next frame to pull from the source
    pub(crate) next_position: usize,
}

impl PlaybackSlot {
    fn new(source: SourceRef, volume: f32) -> Self {
        Self {
            source,
            volume,
            next_position: 0,
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn next_position(&self) -> usize {
        self.next_position
    }

    fn is_source<S: SampleSource + ?Sized>(&self, source: &Arc<S>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.source), Arc::as_ptr(source))
    }

    /// Remove from the active set: the play counter drops before the slot does
    fn release(self) {
        self.source.play_counter().decrement();
    }
}

pub(crate) struct MixerState {
    pub(crate) master_volume: f32,
    pub(crate) slots: Vec<PlaybackSlot>,
}

struct MixerShared {
    state: Mutex<MixerState>,
    shutdown: AtomicBool,
}

/// Handle to the sound mixer state
///
/// Clones share the same state; every method is safe to call from any
/// thread, including while a period is being mixed.
#[derive(Clone)]
pub struct Mixer {
    shared: Arc<MixerShared>,
}

impl Mixer {
    pub fn new(master_volume: f32) -> Self {
        Self {
            shared: Arc::new(MixerShared {
                state: Mutex::new(MixerState {
                    master_volume,
                    slots: Vec::new(),
                }),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.shared.state.lock().unwrap_or_else(|e| {
            warn!("Sound mixer mutex poisoned; continuing");
            e.into_inner()
        })
    }

    /// Start playing `source` from its first frame
    ///
    /// The same source may be started several times; each call adds an
    /// independent slot. Ignored once the mixer is shutting down.
    pub fn play(&self, source: SourceRef, volume: f32) {
        if self.is_shutting_down() {
            trace!("Sound mixer shutting down, ignoring play");
            return;
        }
        source.play_counter().increment();
        let slot = PlaybackSlot::new(source, volume);
        let mut state = self.lock();
        state.slots.push(slot);
        trace!("Started sound, {} active", state.slots.len());
    }

    /// Stop every slot playing `source`. No-op if it isn't playing.
    pub fn stop<S: SampleSource + ?Sized>(&self, source: &Arc<S>) {
        let mut state = self.lock();
        let mut idx = state.slots.len();
        while idx > 0 {
            idx -= 1;
            if state.slots[idx].is_source(source) {
                state.slots.swap_remove(idx).release();
            }
        }
    }

    /// Stop everything that is currently playing
    pub fn stop_all(&self) {
        let slots = std::mem::take(&mut self.lock().slots);
        for slot in slots {
            slot.release();
        }
    }

    /// Set the master volume. Clipping happens at the output stage, so no
    /// range is enforced here.
    pub fn set_master_volume(&self, volume: f32) {
        self.lock().master_volume = volume;
    }

    pub fn master_volume(&self) -> f32 {
        self.lock().master_volume
    }

    /// Number of active slots
    pub fn active_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of active slots playing `source`
    pub fn slot_count<S: SampleSource + ?Sized>(&self, source: &Arc<S>) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.is_source(source))
            .count()
    }

    /// Cursor positions of every slot playing `source`
    pub fn positions<S: SampleSource + ?Sized>(&self, source: &Arc<S>) -> Vec<usize> {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.is_source(source))
            .map(PlaybackSlot::next_position)
            .collect()
    }

    pub(crate) fn request_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new(DEFAULT_MASTER_VOLUME)
    }
}
