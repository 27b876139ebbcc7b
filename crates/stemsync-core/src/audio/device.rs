//! Audio device enumeration
//!
//! Lists output devices from every available host so the player can print
//! them (`--list-devices`) and resolve a configured [`DeviceId`].

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Host, HostId};

use super::config::DeviceId;
use super::error::{AudioError, AudioResult};

/// Display label for a CPAL host
fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        _ => name,
    }
}

fn get_host_by_name(name: &str) -> Option<Host> {
    cpal::available_hosts()
        .into_iter()
        .find(|id| host_name(*id) == name)
        .and_then(|id| cpal::host_from_id(id).ok())
}

/// Information about an audio output device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device identifier for configuration (includes host info)
    pub id: DeviceId,
    /// Human-readable device name
    pub name: String,
    /// Host backend name (e.g., "ALSA", "CoreAudio")
    pub host: String,
    /// Whether this is the system default device for its host
    pub is_default: bool,
    /// Supported sample rates (common ones)
    pub sample_rates: Vec<u32>,
    /// Maximum output channels
    pub max_channels: u16,
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.host, self.name)?;
        if self.is_default {
            write!(f, " (default)")?;
        }
        Ok(())
    }
}

/// Rates worth reporting for a device
const STANDARD_RATES: [u32; 6] = [44_100, 48_000, 88_200, 96_000, 176_400, 192_000];

/// Describe one output device, or `None` if it exposes no usable config
fn describe(device: &cpal::Device, host: &str, default_name: Option<&str>) -> Option<AudioDevice> {
    let name = device.name().ok()?;
    let configs: Vec<_> = device.supported_output_configs().ok()?.collect();
    if configs.is_empty() {
        return None;
    }

    let max_channels = configs.iter().map(|c| c.channels()).max().unwrap_or(0);
    let sample_rates = STANDARD_RATES
        .into_iter()
        .filter(|rate| {
            configs
                .iter()
                .any(|c| (c.min_sample_rate().0..=c.max_sample_rate().0).contains(rate))
        })
        .collect();

    Some(AudioDevice {
        id: DeviceId::with_host(&name, host),
        is_default: default_name == Some(name.as_str()),
        name,
        host: host.to_string(),
        sample_rates,
        max_channels,
    })
}

/// Every output device of every host, defaults first
pub fn get_output_devices() -> AudioResult<Vec<AudioDevice>> {
    let mut devices = Vec::new();

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(host) => host,
            Err(e) => {
                log::debug!("Skipping host {:?}: {}", host_id, e);
                continue;
            }
        };
        let label = host_name(host_id);
        let default_name = host.default_output_device().and_then(|d| d.name().ok());

        match host.output_devices() {
            Ok(outputs) => devices.extend(
                outputs.filter_map(|device| describe(&device, &label, default_name.as_deref())),
            ),
            Err(e) => log::debug!("No output devices on {}: {}", label, e),
        }
    }

    if devices.is_empty() {
        return Err(AudioError::NoDevices);
    }
    devices.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then_with(|| a.host.cmp(&b.host))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(devices)
}

fn find_on_host(host: &Host, name: &str) -> Option<cpal::Device> {
    host.output_devices()
        .ok()?
        .find(|d| d.name().map_or(false, |n| n == name))
}

/// Resolve a configured device, searching its host first when one is named
pub fn find_device_by_id(id: &DeviceId) -> AudioResult<cpal::Device> {
    let named_host = id.host.as_deref().and_then(get_host_by_name);
    let found = match named_host {
        Some(host) => find_on_host(&host, &id.name),
        None => cpal::available_hosts()
            .into_iter()
            .filter_map(|host_id| cpal::host_from_id(host_id).ok())
            .find_map(|host| find_on_host(&host, &id.name)),
    };
    found.ok_or_else(|| AudioError::DeviceNotFound(id.name.clone()))
}

/// Default output of the default host
pub fn get_cpal_default_device() -> AudioResult<cpal::Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::NoDefaultDevice("No default output device".to_string()))
}
