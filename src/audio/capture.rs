//! Microphone capture into the shared ring buffer using cpal.
//!
//! The cpal stream lives on a dedicated thread for its whole life: the
//! callback runs on the backend's realtime audio thread and only ever takes
//! the ring buffer lock for the duration of one append.

use crate::audio::ring_buffer::{SharedRingBuffer, lock_ring};
use crate::audio::{AudioFormat, Direction, SampleDepth, device_name, find_device};
use crate::error::{HarmonyError, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SizedSample, StreamConfig};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source of raw microphone bytes.
pub trait AudioInput: Send + Sync {
    /// Open the input device and start appending captured PCM to `ring`.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Audio`] if the device cannot be opened.
    fn start(
        &self,
        format: AudioFormat,
        stepping_ms: u32,
        ring: SharedRingBuffer,
    ) -> Result<Box<dyn ActiveCapture>>;
}

/// A running capture stream.
pub trait ActiveCapture: Send {
    /// Stop capturing and release the device.
    fn stop(self: Box<Self>) -> Result<()>;
}

/// Microphone input via cpal.
pub struct CpalInput {
    device_name: String,
}

impl CpalInput {
    /// Resolve the microphone up front so a bad name fails at setup time.
    ///
    /// # Errors
    ///
    /// Returns an error if no matching input device is available.
    pub fn new(microphone: &str) -> Result<Self> {
        let device = find_device(Direction::Input, microphone)?;
        Ok(Self {
            device_name: device_name(&device),
        })
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        use cpal::traits::HostTrait;
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| HarmonyError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices.map(|d| device_name(&d)).collect())
    }
}

impl AudioInput for CpalInput {
    fn start(
        &self,
        format: AudioFormat,
        stepping_ms: u32,
        ring: SharedRingBuffer,
    ) -> Result<Box<dyn ActiveCapture>> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("harmony-capture".into())
            .spawn(move || {
                let stream = match open_input_stream(&name, format, stepping_ms, ring) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(HarmonyError::Audio(format!(
                        "failed to start input stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Hold the stream alive until stopped (or the handle is dropped).
                let _ = stop_rx.recv();
                drop(stream);
                debug!("capture stream closed");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "continuous recording started: {}Hz, {} ch, {}-bit",
                    format.sample_rate,
                    format.channels,
                    format.depth.bits()
                );
                Ok(Box::new(CpalCapture {
                    stop_tx,
                    thread: Some(thread),
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(HarmonyError::Audio("capture thread exited during startup".into()))
            }
        }
    }
}

/// Handle to the capture thread.
struct CpalCapture {
    stop_tx: crossbeam_channel::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveCapture for CpalCapture {
    fn stop(mut self: Box<Self>) -> Result<()> {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| HarmonyError::Audio("capture thread panicked".into()))?;
        }
        info!("continuous recording stopped");
        Ok(())
    }
}

fn open_input_stream(
    name: &str,
    format: AudioFormat,
    stepping_ms: u32,
    ring: SharedRingBuffer,
) -> Result<cpal::Stream> {
    let device = find_device(Direction::Input, name)?;
    let fixed = StreamConfig {
        channels: format.channels,
        sample_rate: format.sample_rate,
        buffer_size: BufferSize::Fixed(format.frames_per_step(stepping_ms)),
    };

    match build_for_depth(&device, &fixed, format.depth, ring.clone()) {
        Ok(stream) => Ok(stream),
        Err(e) => {
            warn!("fixed capture block size rejected ({e}); retrying with device default");
            let fallback = StreamConfig {
                buffer_size: BufferSize::Default,
                ..fixed
            };
            build_for_depth(&device, &fallback, format.depth, ring)
        }
    }
}

fn build_for_depth(
    device: &cpal::Device,
    config: &StreamConfig,
    depth: SampleDepth,
    ring: SharedRingBuffer,
) -> Result<cpal::Stream> {
    match depth {
        SampleDepth::Bits8 => build_stream::<i8, _>(device, config, ring, |data, out| {
            out.extend(data.iter().map(|s| s.to_le_bytes()[0]));
        }),
        SampleDepth::Bits16 => build_stream::<i16, _>(device, config, ring, |data, out| {
            for s in data {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }),
        // Captured as i32 and packed to the top three bytes, little-endian.
        SampleDepth::Bits24 => build_stream::<i32, _>(device, config, ring, |data, out| {
            for s in data {
                out.extend_from_slice(&s.to_le_bytes()[1..]);
            }
        }),
        SampleDepth::Bits32 => build_stream::<i32, _>(device, config, ring, |data, out| {
            for s in data {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }),
    }
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    ring: SharedRingBuffer,
    encode: F,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    F: Fn(&[T], &mut Vec<u8>) + Send + 'static,
{
    let mut scratch = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                scratch.clear();
                encode(data, &mut scratch);
                lock_ring(&ring).append(&scratch);
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| HarmonyError::Audio(format!("failed to build input stream: {e}")))
}
