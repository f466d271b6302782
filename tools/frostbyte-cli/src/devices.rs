//! Devices command - list what cpal can see

use anyhow::Result;
use clap::Args;

use frostbyte_audio::{DeviceInfo, enumerate_devices};

/// Arguments for the devices command
#[derive(Args)]
pub struct DevicesArgs {
    /// Only list devices that can play sound
    #[arg(long)]
    pub output_only: bool,
}

/// Execute the devices command
pub fn execute(args: DevicesArgs) -> Result<()> {
    let devices: Vec<DeviceInfo> = enumerate_devices()
        .into_iter()
        .filter(|d| !args.output_only || d.supports_output)
        .collect();

    if devices.is_empty() {
        println!("No audio devices found");
        return Ok(());
    }

    for device in &devices {
        println!("{:<6} {}", direction(device), device.description);
    }
    Ok(())
}

fn direction(device: &DeviceInfo) -> &'static str {
    match (device.supports_input, device.supports_output) {
        (true, true) => "in/out",
        (false, true) => "out",
        (true, false) => "in",
        (false, false) => "-",
    }
}
