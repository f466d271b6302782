//! Tone command - play a sine wave through the sound mixer
//!
//! Settings come from audio.toml (or `--config`), with command line flags
//! taking precedence.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::info;

use frostbyte_audio::sound::MAX_SINE_SECONDS;
use frostbyte_audio::{AudioConfig, BackendMode, Sound, SoundMixer};

/// Backend choice on the command line
#[derive(Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Auto,
    Callback,
    Polling,
}

impl From<BackendArg> for BackendMode {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendMode::Auto,
            BackendArg::Callback => BackendMode::Callback,
            BackendArg::Polling => BackendMode::Polling,
        }
    }
}

/// Arguments for the tone command
#[derive(Args)]
pub struct ToneArgs {
    /// Output device name (see `frostbyte devices`)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Tone frequency in Hz
    #[arg(short, long, default_value = "440")]
    pub frequency: f32,

    /// How long to play (at most one hour)
    #[arg(short, long, default_value = "1.0", value_parser = parse_seconds)]
    pub seconds: f32,

    /// Master volume (overrides audio.toml)
    #[arg(short, long)]
    pub volume: Option<f32>,

    /// Driver backend (overrides audio.toml)
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Path to an audio.toml to use instead of the platform one
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

fn parse_seconds(arg: &str) -> Result<f32, String> {
    let seconds: f32 = arg.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=MAX_SINE_SECONDS).contains(&seconds) {
        Ok(seconds)
    } else {
        Err(format!("must be between 0 and {MAX_SINE_SECONDS}"))
    }
}

/// Execute the tone command
pub fn execute(args: ToneArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => AudioConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => AudioConfig::load_or_default(),
    };
    if let Some(device) = args.device {
        config.output_device = Some(device);
    }
    if let Some(volume) = args.volume {
        config.master_volume = volume;
    }
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }

    let mut mixer = SoundMixer::start(&config).context("Failed to start sound mixer")?;
    info!(
        "Playing {} Hz for {:.1}s via {:?} backend",
        args.frequency,
        args.seconds,
        mixer.backend_kind()
    );

    let tone = Arc::new(Sound::sine(args.frequency, args.seconds, 0.5));
    mixer.play(tone.clone(), 1.0);

    // Wait for the tone to drain, plus slack for the device buffer
    let deadline = Instant::now() + Duration::from_secs_f32(args.seconds + 1.0);
    while tone.is_playing() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let buffer_time = mixer.negotiated().buffer_frames as f32 / frostbyte_audio::SAMPLE_RATE as f32;
    thread::sleep(Duration::from_secs_f32(buffer_time));

    mixer.shutdown().context("Failed to stop sound mixer")?;
    Ok(())
}
