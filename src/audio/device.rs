//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::StreamConfig;
use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Rates a voice session can ask for
const PROBED_SAMPLE_RATES: [u32; 4] = [16_000, 24_000, 44_100, 48_000];

/// Serializable description of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// `input:<name>` or `output:<name>`
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn prefix(self) -> &'static str {
        match self {
            Direction::Input => "input:",
            Direction::Output => "output:",
        }
    }
}

/// List every input and output endpoint on the default host
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = capabilities(&device, Direction::Input);
                devices.push(DeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = capabilities(&device, Direction::Output);
                devices.push(DeviceInfo {
                    id: format!("output:{}", name),
                    is_default: default_output.as_ref() == Some(&name),
                    name,
                    is_input: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn supported_configs(device: &cpal::Device, direction: Direction) -> Vec<cpal::SupportedStreamConfigRange> {
    match direction {
        Direction::Input => device
            .supported_input_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default(),
        Direction::Output => device
            .supported_output_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default(),
    }
}

fn capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let configs = supported_configs(device, direction);

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in PROBED_SAMPLE_RATES {
            let sample_rate = cpal::SampleRate(rate);
            if sample_rate >= config.min_sample_rate()
                && sample_rate <= config.max_sample_rate()
                && !rates.contains(&rate)
            {
                rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// `wanted` when some range offers it at `channels`, else `fallback`
fn pick_rate(
    configs: &[cpal::SupportedStreamConfigRange],
    channels: u16,
    wanted: u32,
    fallback: u32,
) -> u32 {
    let rate = cpal::SampleRate(wanted);
    let supported = configs.iter().any(|range| {
        range.channels() == channels && range.min_sample_rate() <= rate && rate <= range.max_sample_rate()
    });
    if supported {
        wanted
    } else {
        fallback
    }
}

/// Stream config at `wanted_rate` when the device runs at it, else at its default rate
///
/// Callers resample between the two when the returned rate differs.
pub fn stream_config(
    device: &cpal::Device,
    direction: Direction,
    wanted_rate: u32,
) -> Result<StreamConfig, AudioError> {
    let default_config = match direction {
        Direction::Input => device.default_input_config(),
        Direction::Output => device.default_output_config(),
    }
    .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

    let channels = default_config.channels();
    let default_rate = default_config.sample_rate().0;
    let configs = supported_configs(device, direction);
    let sample_rate = pick_rate(&configs, channels, wanted_rate, default_rate);
    if sample_rate != wanted_rate {
        tracing::warn!(
            "{:?} device cannot run at {} Hz, opening at {} Hz and resampling",
            direction,
            wanted_rate,
            sample_rate
        );
    }

    Ok(StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

/// Find a device by id; a bare name is looked up in `direction`
pub fn get_device_by_id(id: &str, direction: Direction) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let name = id.strip_prefix(direction.prefix()).unwrap_or(id);

    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// The named device, or the host default when `id` is `None`
pub fn resolve_device(id: Option<&str>, direction: Direction) -> Result<cpal::Device, AudioError> {
    if let Some(id) = id {
        return get_device_by_id(id, direction);
    }
    let host = cpal::default_host();
    let device = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    };
    device.ok_or_else(|| {
        AudioError::DeviceNotFound(format!("no default {} device", direction.prefix().trim_end_matches(':')))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_device_is_not_found() {
        let result = get_device_by_id("input:__no_such_device__", Direction::Input);
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    }

    fn range(channels: u16, min: u32, max: u32) -> cpal::SupportedStreamConfigRange {
        cpal::SupportedStreamConfigRange::new(
            channels,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            cpal::SupportedBufferSize::Unknown,
            cpal::SampleFormat::F32,
        )
    }

    #[test]
    fn test_pick_rate_prefers_wanted() {
        let configs = [range(2, 8_000, 96_000)];
        assert_eq!(pick_rate(&configs, 2, 24_000, 48_000), 24_000);
    }

    #[test]
    fn test_pick_rate_falls_back_to_device_rate() {
        // A 48 kHz-only output cannot take the 24 kHz playback rate
        let configs = [range(2, 48_000, 48_000), range(1, 8_000, 48_000)];
        assert_eq!(pick_rate(&configs, 2, 24_000, 48_000), 48_000);
        assert_eq!(pick_rate(&[], 2, 24_000, 44_100), 44_100);
    }

    #[test]
    fn test_listed_ids_are_prefixed() {
        // Hosts without audio hardware return an empty list
        for device in list_devices() {
            let prefix = if device.is_input { "input:" } else { "output:" };
            assert!(device.id.starts_with(prefix));
        }
    }
}
