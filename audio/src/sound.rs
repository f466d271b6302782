//! Sample sources consumed by the mixer
//!
//! A source is an already-decoded, in-memory provider of interleaved stereo
//! 16-bit PCM. Memory ownership goes through `Arc`; whether a sound is
//! currently audible is tracked separately by its play counter, because one
//! source may back several playback slots at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::CHANNELS;

/// Interleaved 16-bit stereo sample provider
pub trait SampleSource: Send + Sync {
    /// Total length in frames (one left + right pair per frame)
    fn duration_samples(&self) -> usize;

    /// Copy up to `frames` frames starting at `start_frame` into `out`.
    ///
    /// Returns the number of frames written, which is less than requested at
    /// end of stream. Must never block.
    fn stream_out(&self, start_frame: usize, frames: usize, out: &mut [i16]) -> usize;

    /// Active-use counter for this source
    fn play_counter(&self) -> &PlayCounter;
}

/// Shared handle to a source as stored by the mixer
pub type SourceRef = Arc<dyn SampleSource>;

/// Number of playback slots currently referencing a source
#[derive(Debug, Default)]
pub struct PlayCounter(AtomicUsize);

impl PlayCounter {
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        if self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!("Play counter decremented below zero");
        }
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Longest tone `Sound::sine` will generate
pub const MAX_SINE_SECONDS: f32 = 3600.0;

/// Decoded sound held fully in memory
#[derive(Debug, Default)]
pub struct Sound {
    /// Interleaved stereo PCM (L, R, L, R, ...)
    samples: Vec<i16>,
    playing: PlayCounter,
}

impl Sound {
    /// Build from interleaved stereo samples. A trailing odd sample is dropped.
    pub fn from_interleaved(mut samples: Vec<i16>) -> Self {
        let whole = samples.len() / CHANNELS * CHANNELS;
        samples.truncate(whole);
        Self {
            samples,
            playing: PlayCounter::new(),
        }
    }

    /// Build from mono samples, duplicated to both channels
    pub fn from_mono(mono: &[i16]) -> Self {
        let samples = mono.iter().flat_map(|&s| [s, s]).collect();
        Self::from_interleaved(samples)
    }

    /// Generate a sine tone at the output sample rate
    pub fn sine(frequency: f32, seconds: f32, amplitude: f32) -> Self {
        let seconds = if seconds.is_finite() {
            seconds.clamp(0.0, MAX_SINE_SECONDS)
        } else {
            0.0
        };
        let frames = (crate::SAMPLE_RATE as f32 * seconds) as usize;
        let step = std::f32::consts::TAU * frequency / crate::SAMPLE_RATE as f32;
        let peak = amplitude.clamp(0.0, 1.0) * i16::MAX as f32;
        let mono: Vec<i16> = (0..frames)
            .map(|i| ((i as f32 * step).sin() * peak) as i16)
            .collect();
        Self::from_mono(&mono)
    }

    /// Interleaved stereo samples
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// True while at least one playback slot references this sound
    pub fn is_playing(&self) -> bool {
        self.playing.get() > 0
    }

    pub fn play_count(&self) -> usize {
        self.playing.get()
    }
}

impl SampleSource for Sound {
    fn duration_samples(&self) -> usize {
        self.samples.len() / CHANNELS
    }

    fn stream_out(&self, start_frame: usize, frames: usize, out: &mut [i16]) -> usize {
        let available = self.duration_samples().saturating_sub(start_frame);
        let count = frames.min(available).min(out.len() / CHANNELS);
        if count == 0 {
            return 0;
        }
        let begin = start_frame * CHANNELS;
        let end = begin + count * CHANNELS;
        out[..count * CHANNELS].copy_from_slice(&self.samples[begin..end]);
        count
    }

    fn play_counter(&self) -> &PlayCounter {
        &self.playing
    }
}
