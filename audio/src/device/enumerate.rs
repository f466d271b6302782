//! Audio device enumeration
//!
//! Lists devices from every available cpal host. Input and output lists are
//! merged by name so a duplex device shows up once with both flags set.

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::debug;

/// An audio device as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Name to pass back when opening the device
    pub name: String,
    /// Human-readable description, including the host backend
    pub description: String,
    pub supports_input: bool,
    pub supports_output: bool,
}

/// List the devices of every available host
///
/// Hosts or device lists that fail to open are skipped with a debug log.
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    let mut list = Vec::new();

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(h) => h,
            Err(e) => {
                debug!("Could not initialize host {:?}: {}", host_id, e);
                continue;
            }
        };

        let outputs = match host.output_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                debug!("Could not list outputs for {:?}: {}", host_id, e);
                Vec::new()
            }
        };
        let inputs = match host.input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                debug!("Could not list inputs for {:?}: {}", host_id, e);
                Vec::new()
            }
        };

        merge_device_lists(host_id.name(), &outputs, &inputs, &mut list);
    }

    list
}

/// Fold one host's output and input names into `list`
fn merge_device_lists(
    host: &str,
    outputs: &[String],
    inputs: &[String],
    list: &mut Vec<DeviceInfo>,
) {
    let first_of_host = list.len();

    for (name, is_output) in outputs
        .iter()
        .map(|n| (n, true))
        .chain(inputs.iter().map(|n| (n, false)))
    {
        let idx = match list[first_of_host..]
            .iter()
            .position(|info| &info.name == name)
        {
            Some(offset) => first_of_host + offset,
            None => {
                list.push(DeviceInfo {
                    name: name.clone(),
                    description: format!("{} ({})", name, host),
                    supports_input: false,
                    supports_output: false,
                });
                list.len() - 1
            }
        };
        let info = &mut list[idx];
        if is_output {
            info.supports_output = true;
        } else {
            info.supports_input = true;
        }
    }
}
