//! Per-period mixing: sum, scale, clip, pack

use std::time::Instant;

use crate::CHANNELS;

use super::Mixer;

/// Bytes per interleaved stereo s16 frame
pub const FRAME_BYTES: usize = CHANNELS * 2;

/// Scratch buffers for one period, allocated once at startup
///
/// Nothing here is reallocated while the mixer runs.
pub struct PeriodBuffers {
    period_frames: usize,
    /// Wide accumulator, one entry per channel sample
    mix: Vec<i32>,
    /// Per-source pull buffer
    tmp: Vec<i16>,
    /// Packed little-endian s16 output
    out: Vec<u8>,
    /// Time spent in the last `mix_period` call (microseconds)
    last_mix_us: f64,
}

impl PeriodBuffers {
    pub fn new(period_frames: usize) -> Self {
        let samples = period_frames * CHANNELS;
        Self {
            period_frames,
            mix: vec![0; samples],
            tmp: vec![0; samples],
            out: vec![0; samples * 2],
            last_mix_us: 0.0,
        }
    }

    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    /// Packed output of the last mixed period
    pub fn output(&self) -> &[u8] {
        &self.out
    }

    /// Fill the output with one period of silence
    pub fn silence(&mut self) -> &[u8] {
        self.out.fill(0);
        &self.out
    }

    pub(crate) fn last_mix_us(&self) -> f64 {
        self.last_mix_us
    }
}

impl Mixer {
    /// Mix one period of every active slot into `buffers` and return the
    /// packed output bytes.
    ///
    /// Slots that reach the end of their source, or whose source produces
    /// nothing, are removed during this pass.
    pub fn mix_period<'a>(&self, buffers: &'a mut PeriodBuffers) -> &'a [u8] {
        let start = Instant::now();
        let period = buffers.period_frames;
        buffers.mix.fill(0);

        let master_volume = {
            let mut state = self.lock();
            let master_volume = state.master_volume;

            // Backward so swap_remove only moves already-mixed slots
            let mut idx = state.slots.len();
            while idx > 0 {
                idx -= 1;
                let slot = &mut state.slots[idx];
                let duration = slot.source.duration_samples();
                let wanted = period.min(duration.saturating_sub(slot.next_position));
                let size = slot
                    .source
                    .stream_out(slot.next_position, wanted, &mut buffers.tmp)
                    .min(wanted);

                accumulate(
                    &mut buffers.mix,
                    &buffers.tmp[..size * CHANNELS],
                    slot.volume,
                );
                slot.next_position += size;

                if slot.next_position >= duration || size == 0 {
                    state.slots.swap_remove(idx).release();
                }
            }

            master_volume
        };

        pack_output(&buffers.mix, master_volume, &mut buffers.out);
        buffers.last_mix_us = start.elapsed().as_micros() as f64;
        &buffers.out
    }
}

/// Add volume-scaled samples into the accumulator
///
/// The float product truncates toward zero on the cast back to integer.
#[inline]
pub(crate) fn accumulate(mix: &mut [i32], samples: &[i16], volume: f32) {
    for (acc, &sample) in mix.iter_mut().zip(samples) {
        *acc = acc.saturating_add((sample as f32 * volume) as i32);
    }
}

/// Apply master volume, hard-clip to ±32767 and pack little-endian
#[inline]
pub(crate) fn pack_output(mix: &[i32], master_volume: f32, out: &mut [u8]) {
    for (acc, bytes) in mix.iter().zip(out.chunks_exact_mut(2)) {
        let value = (*acc as f32 * master_volume).clamp(-32767.0, 32767.0) as i16;
        bytes.copy_from_slice(&value.to_le_bytes());
    }
}
