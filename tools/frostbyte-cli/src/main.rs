//! Frostbyte CLI - sound output diagnostics
//!
//! # Commands
//!
//! - `frostbyte devices` - List audio devices on every host
//! - `frostbyte tone` - Play a test tone through the sound mixer
//!
//! # Usage
//!
//! ```bash
//! # Which devices can we open?
//! frostbyte devices
//!
//! # Two seconds of A4 on the default device, forcing the polling thread
//! frostbyte tone --seconds 2 --backend polling
//! ```
//!
//! Set `RUST_LOG=frostbyte_audio=debug` to see negotiation, backend
//! selection and the once-per-second driver metrics.

mod devices;
mod tone;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Frostbyte CLI - sound output diagnostics
#[derive(Parser)]
#[command(name = "frostbyte")]
#[command(about = "Sound output diagnostics for Frostbyte")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List audio devices
    Devices(devices::DevicesArgs),

    /// Play a sine tone through the mixer
    Tone(tone::ToneArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices(args) => devices::execute(args),
        Commands::Tone(args) => tone::execute(args),
    }
}
