//! Speaker output for decoded utterances via cpal.

use crate::audio::{Direction, device_name, find_device};
use crate::error::{HarmonyError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, StreamTrait};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// One decoded utterance ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    /// Reference the backend used for this audio (echoed back on completion).
    pub source_id: String,
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlaybackItem {
    /// Number of frames (samples per channel).
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }
}

/// Sink for decoded speech.
pub trait AudioOutput: Send + Sync {
    /// Start streaming `item`. `finished` fires once, after the last frame
    /// has been handed to the device.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Audio`] if the stream cannot be opened.
    fn play(
        &self,
        item: PlaybackItem,
        finished: oneshot::Sender<()>,
    ) -> Result<Box<dyn ActiveOutput>>;
}

/// A running output stream.
pub trait ActiveOutput: Send {
    /// Stop output immediately and release the stream.
    fn stop(self: Box<Self>);
}

/// Audio playback to system speakers via cpal.
pub struct CpalOutput {
    device_name: String,
}

impl CpalOutput {
    /// Resolve the speaker up front so a bad name fails at setup time.
    ///
    /// # Errors
    ///
    /// Returns an error if no matching output device is available.
    pub fn new(speaker: &str) -> Result<Self> {
        let device = find_device(Direction::Output, speaker)?;
        Ok(Self {
            device_name: device_name(&device),
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        use cpal::traits::HostTrait;
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| HarmonyError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices.map(|d| device_name(&d)).collect())
    }
}

impl AudioOutput for CpalOutput {
    fn play(
        &self,
        item: PlaybackItem,
        finished: oneshot::Sender<()>,
    ) -> Result<Box<dyn ActiveOutput>> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let name = self.device_name.clone();
        let source_id = item.source_id.clone();

        let thread = std::thread::Builder::new()
            .name("harmony-playback".into())
            .spawn(move || {
                let stream = match open_output_stream(&name, item, finished) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(HarmonyError::Audio(format!(
                        "failed to start output stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!("playing {source_id}");
                Ok(Box::new(CpalStream {
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
                Err(HarmonyError::Audio("playback thread exited during startup".into()))
            }
        }
    }
}

struct CpalStream {
    stop_tx: crossbeam_channel::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveOutput for CpalStream {
    fn stop(mut self: Box<Self>) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("playback thread panicked");
        }
    }
}

fn open_output_stream(
    name: &str,
    item: PlaybackItem,
    finished: oneshot::Sender<()>,
) -> Result<cpal::Stream> {
    let device = find_device(Direction::Output, name)?;
    let stream_config = StreamConfig {
        channels: item.channels.max(1),
        sample_rate: item.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    info!(
        "opening output stream: {}Hz, {} ch, {} frames",
        item.sample_rate,
        item.channels,
        item.frames()
    );

    let mut cursor = OutputCursor::new(item.samples, finished);
    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                cursor.fill(data);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| HarmonyError::Audio(format!("failed to build output stream: {e}")))
}

/// Read position into an utterance, owned by the output callback.
struct OutputCursor {
    samples: Vec<f32>,
    position: usize,
    finished: Option<oneshot::Sender<()>>,
}

impl OutputCursor {
    fn new(samples: Vec<f32>, finished: oneshot::Sender<()>) -> Self {
        Self {
            samples,
            position: 0,
            finished: Some(finished),
        }
    }

    /// Copy the next window into `out`; zero-pad and signal once exhausted.
    fn fill(&mut self, out: &mut [f32]) {
        let available = self.samples.len() - self.position;
        let n = available.min(out.len());
        out[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        self.position += n;

        if n < out.len() {
            out[n..].fill(0.0);
            if let Some(tx) = self.finished.take() {
                let _ = tx.send(());
            }
        }
    }
}
