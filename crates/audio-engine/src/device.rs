//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing a stream config and buffer size for the software mixer

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Mixer rate we ask devices for when they support a range.
pub const PREFERRED_RATE: u32 = 48_000;

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
///
/// Returns an error if no suitable device is found.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the best output config for a target sample rate.
///
/// Prefers the highest supported rate that is **<= target_rate**; if none are,
/// the lowest rate above it. Ties go to the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();

    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if range.channels() == 0 {
            continue;
        }
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.map(|t| rate <= t).unwrap_or(true);
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, format_rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, format_rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, _, _, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Prefer a fixed buffer size if the device advertises one.
///
/// Returns `None` when the device only supports the default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            // Small blocks keep the calibrated clock close to what the device plays.
            const TARGET_FRAMES: u32 = 1_024;
            Some(cpal::BufferSize::Fixed(TARGET_FRAMES.clamp(*min, (*max).max(*min))))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

/// Lightweight output device metadata for `--list-devices`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
}

/// Describe every output device on the host.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());

    let devices = host.output_devices().context("No output devices")?;
    let mut out = Vec::new();
    for d in devices {
        let name = d.description()?.name().to_string();
        let (mut min_rate, mut max_rate, mut max_channels) = (u32::MAX, 0u32, 0u16);
        match d.supported_output_configs() {
            Ok(ranges) => {
                for r in ranges {
                    min_rate = min_rate.min(r.min_sample_rate());
                    max_rate = max_rate.max(r.max_sample_rate());
                    max_channels = max_channels.max(r.channels());
                }
            }
            Err(e) => tracing::debug!(device = %name, "cannot query output configs: {e}"),
        }
        if min_rate > max_rate {
            tracing::warn!(device = %name, "skipping device with no usable output config");
            continue;
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
            max_channels,
        });
    }
    Ok(out)
}

/// [`list_devices`] on the default host.
pub fn list_output_devices() -> Result<Vec<DeviceInfo>> {
    list_devices(&cpal::default_host())
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
