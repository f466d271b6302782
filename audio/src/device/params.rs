//! Hardware parameter negotiation
//!
//! The device advertises a set of configuration ranges; negotiation picks one
//! that honors the fixed output format exactly and sizes the period and
//! buffer as close to the requested times as the device allows.

use cpal::SampleFormat;

use crate::error::DeviceError;
use crate::{CHANNELS, SAMPLE_RATE};

/// Target buffer time (~50ms)
pub const DEFAULT_BUFFER_TIME_US: u32 = 50_000;

/// Target period time (~10ms)
pub const DEFAULT_PERIOD_TIME_US: u32 = 10_000;

/// Requested hardware parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwParams {
    pub rate: u32,
    pub channels: u16,
    pub buffer_time_us: u32,
    pub period_time_us: u32,
}

impl HwParams {
    pub fn with_times(buffer_time_us: u32, period_time_us: u32) -> Self {
        Self {
            buffer_time_us,
            period_time_us,
            ..Self::default()
        }
    }
}

impl Default for HwParams {
    fn default() -> Self {
        Self {
            rate: SAMPLE_RATE,
            channels: CHANNELS as u16,
            buffer_time_us: DEFAULT_BUFFER_TIME_US,
            period_time_us: DEFAULT_PERIOD_TIME_US,
        }
    }
}

/// One configuration range advertised by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateConfig {
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
    pub format: SampleFormat,
    /// Supported callback buffer sizes in frames, if the device reports them
    pub buffer_range: Option<(u32, u32)>,
}

impl CandidateConfig {
    fn supports_rate(&self, rate: u32) -> bool {
        self.min_rate <= rate && rate <= self.max_rate
    }
}

/// Parameters actually granted by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub rate: u32,
    pub period_frames: usize,
    pub buffer_frames: usize,
    /// Whether the device accepted a fixed period size
    pub fixed_period: bool,
}

/// Frames covered by `time_us` microseconds at `rate`
pub fn frames_for_time(rate: u32, time_us: u32) -> usize {
    (rate as u64 * time_us as u64 / 1_000_000) as usize
}

/// Pick a configuration for `params` out of the device's `candidates`
///
/// Channel count, format, and sample rate must match exactly; there is no
/// fallback rate.
pub fn negotiate(
    params: &HwParams,
    candidates: &[CandidateConfig],
) -> Result<Negotiated, DeviceError> {
    if candidates.is_empty() {
        return Err(DeviceError::Negotiation {
            step: "get sound configuration space",
            reason: "device reports no output configurations".into(),
        });
    }

    let with_channels: Vec<_> = candidates
        .iter()
        .filter(|c| c.channels == params.channels)
        .collect();
    if with_channels.is_empty() {
        return Err(DeviceError::Negotiation {
            step: "set 2 channels",
            reason: format!("device does not offer {} channels", params.channels),
        });
    }

    let with_format: Vec<_> = with_channels
        .into_iter()
        .filter(|c| c.format == SampleFormat::I16)
        .collect();
    if with_format.is_empty() {
        return Err(DeviceError::Negotiation {
            step: "set sample format",
            reason: "signed 16-bit samples not supported".into(),
        });
    }

    let Some(chosen) = with_format.iter().find(|c| c.supports_rate(params.rate)) else {
        // Report the nearest rate the device would have granted
        let near = with_format[0];
        return Err(DeviceError::RateMismatch {
            requested: params.rate,
            actual: params.rate.clamp(near.min_rate, near.max_rate),
        });
    };

    let period_target = frames_for_time(params.rate, params.period_time_us).max(1);
    let buffer_target = frames_for_time(params.rate, params.buffer_time_us);

    let (period_frames, fixed_period) = match chosen.buffer_range {
        Some((min, max)) if min <= max => {
            (period_target.clamp(min as usize, max as usize).max(1), true)
        }
        _ => (period_target, false),
    };

    Ok(Negotiated {
        rate: params.rate,
        period_frames,
        buffer_frames: buffer_target.max(period_frames * 2),
        fixed_period,
    })
}
