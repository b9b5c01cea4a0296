//! CPAL device discovery
//!
//! Lists the host's devices and probes the default input/output
//! configuration the streams in [`super::stream`] are opened with.

use cpal::traits::{DeviceTrait, HostTrait};
use patchbay_core::domain::audio::{AudioError, Result};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Which way audio flows through a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceDirection {
    Input,
    Output,
    Duplex,
}

impl fmt::Display for DeviceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Duplex => write!(f, "duplex"),
        }
    }
}

/// Default stream layout of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceConfig {
    pub channels: u16,
    pub sample_rate: u32,
}

impl DeviceConfig {
    pub(crate) fn from_supported(config: &cpal::SupportedStreamConfig) -> Self {
        Self {
            channels: config.channels(),
            sample_rate: config.sample_rate(),
        }
    }

    pub(crate) fn to_cpal(self) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: self.channels,
            sample_rate: self.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

/// A device as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub direction: DeviceDirection,
    pub default_input: Option<DeviceConfig>,
    pub default_output: Option<DeviceConfig>,
}

impl DeviceInfo {
    fn probe(device: &cpal::Device) -> Option<Self> {
        #[allow(deprecated)]
        let name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());

        let default_input = device
            .default_input_config()
            .ok()
            .map(|c| DeviceConfig::from_supported(&c));
        let default_output = device
            .default_output_config()
            .ok()
            .map(|c| DeviceConfig::from_supported(&c));

        let direction = match (default_input.is_some(), default_output.is_some()) {
            (true, true) => DeviceDirection::Duplex,
            (true, false) => DeviceDirection::Input,
            (false, true) => DeviceDirection::Output,
            (false, false) => {
                debug!(%name, "Device has no usable configuration");
                return None;
            }
        };

        Some(Self {
            name,
            direction,
            default_input,
            default_output,
        })
    }
}

/// Enumerate every device of the default host
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    debug!("Using audio host: {:?}", host.id());

    let devices: Vec<DeviceInfo> = host
        .devices()
        .map_err(|e| AudioError::OsError(e.to_string()))?
        .filter_map(|device| DeviceInfo::probe(&device))
        .collect();

    info!("Found {} audio devices", devices.len());
    Ok(devices)
}

pub(crate) fn default_input_device() -> Result<(cpal::Device, DeviceConfig)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))?;
    let config = device
        .default_input_config()
        .map_err(|e| AudioError::InvalidConfiguration(e.to_string()))?;
    Ok((device, DeviceConfig::from_supported(&config)))
}

pub(crate) fn default_output_device() -> Result<(cpal::Device, DeviceConfig)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))?;
    let config = device
        .default_output_config()
        .map_err(|e| AudioError::InvalidConfiguration(e.to_string()))?;
    Ok((device, DeviceConfig::from_supported(&config)))
}

/// Default output layout, used to size the software context before any
/// stream is opened
pub fn default_output_config() -> Result<DeviceConfig> {
    default_output_device().map(|(_, config)| config)
}

/// Default input layout
pub fn default_input_config() -> Result<DeviceConfig> {
    default_input_device().map(|(_, config)| config)
}

pub(crate) fn device_name(device: &cpal::Device) -> String {
    #[allow(deprecated)]
    device.name().unwrap_or_else(|e| {
        warn!("Could not read device name: {}", e);
        "Unknown Device".to_string()
    })
}
