//! Audio capture, playback, and the capture ring buffer.

pub mod capture;
pub mod playback;
pub mod ring_buffer;

use crate::error::{HarmonyError, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info};

/// Supported integer PCM sample widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDepth {
    Bits8,
    Bits16,
    Bits24,
    Bits32,
}

impl SampleDepth {
    #[must_use]
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(Self::Bits8),
            16 => Some(Self::Bits16),
            24 => Some(Self::Bits24),
            32 => Some(Self::Bits32),
            _ => None,
        }
    }

    #[must_use]
    pub fn bits(self) -> u16 {
        match self {
            Self::Bits8 => 8,
            Self::Bits16 => 16,
            Self::Bits24 => 24,
            Self::Bits32 => 32,
        }
    }

    #[must_use]
    pub fn bytes(self) -> usize {
        usize::from(self.bits() / 8)
    }
}

/// Raw PCM layout used for capture and for byte-offset arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub depth: SampleDepth,
}

impl AudioFormat {
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, depth: SampleDepth) -> Self {
        Self {
            sample_rate,
            channels,
            depth,
        }
    }

    /// Bytes produced per second of capture.
    #[must_use]
    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.channels) * self.depth.bytes() as u64
    }

    /// Frames delivered per capture callback for the given stepping.
    #[must_use]
    pub fn frames_per_step(&self, stepping_ms: u32) -> u32 {
        ((u64::from(self.sample_rate) * u64::from(stepping_ms)) / 1000).max(1) as u32
    }
}

/// Which way a device is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Input,
    Output,
}

/// Resolve a device by name.
///
/// `"default"` (or an empty name) selects the host default; anything else
/// picks the first device whose name contains the given text.
pub(crate) fn find_device(direction: Direction, wanted: &str) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let wanted = wanted.trim();

    let devices: Vec<cpal::Device> = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| HarmonyError::Audio(format!("cannot enumerate devices: {e}")))?
    .collect();

    if devices.is_empty() {
        return Err(HarmonyError::Audio(format!(
            "no {} devices available",
            direction_label(direction)
        )));
    }
    debug!(
        "available {} devices: {:?}",
        direction_label(direction),
        devices.iter().map(device_name).collect::<Vec<_>>()
    );

    let device = if wanted.is_empty() || wanted.eq_ignore_ascii_case("default") {
        match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        }
        .ok_or_else(|| {
            HarmonyError::Audio(format!("no default {} device", direction_label(direction)))
        })?
    } else {
        devices
            .into_iter()
            .find(|d| device_name(d).contains(wanted))
            .ok_or_else(|| {
                HarmonyError::Audio(format!(
                    "no {} device with name containing '{wanted}'",
                    direction_label(direction)
                ))
            })?
    };

    info!(
        "using {} device: {}",
        direction_label(direction),
        device_name(&device)
    );
    Ok(device)
}

pub(crate) fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into())
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Input => "input",
        Direction::Output => "output",
    }
}
