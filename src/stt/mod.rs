//! Speech input for one entity.
//!
//! [`SpeechToTextHandler`] keeps the microphone recording into the ring
//! buffer while the entity listens, answers the backend's byte-range
//! fetches, and relays finished utterances and speech boundaries to the
//! other entities in the scene.

pub mod recording;

pub use recording::{DEFAULT_FETCH_SECS, RecordingCoordinator, RecordingRequest};

use crate::audio::AudioFormat;
use crate::audio::capture::{ActiveCapture, AudioInput};
use crate::audio::ring_buffer::{AudioRingBuffer, SharedRingBuffer};
use crate::config::SttConfig;
use crate::connector::{EventHandler, EventSender};
use crate::entity::EntityDirectory;
use crate::error::Result;
use crate::event::{
    Event, EventStatus, EventType, FetchMicrophoneRequest, StartListenPayload, UtterancePayload,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Event id of relayed utterances, per speaking entity.
#[must_use]
pub fn utterance_event_id(entity_id: &str) -> String {
    format!("actor_{entity_id}_VAD_utterance")
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// STT module of one entity.
pub struct SpeechToTextHandler {
    entity_id: String,
    config: SttConfig,
    format: AudioFormat,
    sender: Arc<dyn EventSender>,
    input: Arc<dyn AudioInput>,
    directory: EntityDirectory,
    ring: SharedRingBuffer,
    recorder: Arc<RecordingCoordinator>,
    capture: Mutex<Option<Box<dyn ActiveCapture>>>,
    listening: AtomicBool,
    listen_lock: tokio::sync::Mutex<()>,
}

impl SpeechToTextHandler {
    /// # Errors
    ///
    /// Returns [`crate::HarmonyError::Config`] for an unsupported capture format.
    pub fn new(
        entity_id: impl Into<String>,
        config: &SttConfig,
        sender: Arc<dyn EventSender>,
        input: Arc<dyn AudioInput>,
        directory: EntityDirectory,
    ) -> Result<Self> {
        let entity_id = entity_id.into();
        let format = config.audio_format()?;
        let ring = AudioRingBuffer::shared(config.ring_capacity_bytes()?);
        let recorder = Arc::new(RecordingCoordinator::new(
            entity_id.clone(),
            Arc::clone(&ring),
            format,
            Arc::clone(&sender),
        ));
        Ok(Self {
            entity_id,
            config: config.clone(),
            format,
            sender,
            input,
            directory,
            ring,
            recorder,
            capture: Mutex::new(None),
            listening: AtomicBool::new(false),
            listen_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// True while the microphone stream is open.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        lock(&self.capture).is_some()
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<RecordingCoordinator> {
        &self.recorder
    }

    #[must_use]
    pub fn ring(&self) -> &SharedRingBuffer {
        &self.ring
    }

    /// Open the microphone and ask the backend to listen.
    ///
    /// Returns `Ok(false)` if already listening.
    ///
    /// # Errors
    ///
    /// Device errors from opening the microphone, or the delivery error of
    /// the start-listen event (recording is stopped again in that case).
    pub async fn start_listen(&self) -> Result<bool> {
        let _guard = self.listen_lock.lock().await;
        if self.is_listening() {
            return Ok(false);
        }

        self.start_continuous_recording()?;

        let payload = StartListenPayload::new(
            self.config.auto_vad,
            self.format.channels,
            self.format.depth.bits(),
            self.format.sample_rate,
        );
        let event = Event::new(
            "start_listen",
            EventType::SttStartListen,
            EventStatus::New,
            serde_json::to_value(payload)?,
        );
        if let Err(e) = self.sender.send_event(event).await {
            error!(entity = %self.entity_id, "listen failed: {e}");
            self.stop_capture();
            return Err(e);
        }

        self.listening.store(true, Ordering::SeqCst);
        info!(entity = %self.entity_id, "listening...");
        Ok(true)
    }

    /// Ask the backend to stop listening, then close the microphone once
    /// outstanding fetches have drained.
    ///
    /// Returns `Ok(false)` if not listening.
    ///
    /// # Errors
    ///
    /// The delivery error of the stop-listen event, or a device error while
    /// closing the stream.
    pub async fn stop_listen(&self) -> Result<bool> {
        let _guard = self.listen_lock.lock().await;
        if !self.is_listening() {
            return Ok(false);
        }

        let event = Event::new(
            "stop_listen",
            EventType::SttStopListen,
            EventStatus::New,
            serde_json::json!({}),
        );
        if let Err(e) = self.sender.send_event(event).await {
            error!(entity = %self.entity_id, "stop listen failed: {e}");
            return Err(e);
        }
        info!(entity = %self.entity_id, "listening stopped, processing speech");

        self.stop_continuous_recording().await?;
        self.listening.store(false, Ordering::SeqCst);
        Ok(true)
    }

    /// Flip between listening and not listening. Returns the new state.
    ///
    /// # Errors
    ///
    /// See [`start_listen`](Self::start_listen) and
    /// [`stop_listen`](Self::stop_listen).
    pub async fn toggle_listen(&self) -> Result<bool> {
        if self.is_listening() {
            self.stop_listen().await?;
        } else {
            self.start_listen().await?;
        }
        Ok(self.is_listening())
    }

    /// Reset the ring buffer and start appending microphone audio to it.
    /// Does nothing if recording is already running.
    ///
    /// # Errors
    ///
    /// Returns [`crate::HarmonyError::Audio`] if the device cannot be opened.
    pub fn start_continuous_recording(&self) -> Result<()> {
        let mut capture = lock(&self.capture);
        if capture.is_some() {
            return Ok(());
        }
        self.recorder.reset();
        let active = self.input.start(
            self.format,
            self.config.record_stepping_ms,
            Arc::clone(&self.ring),
        )?;
        *capture = Some(active);
        debug!(entity = %self.entity_id, "continuous recording started");
        Ok(())
    }

    /// Wait for in-flight fetches (bounded by the drain timeout), then close
    /// the microphone. Returns `Ok(false)` if nothing was recording.
    ///
    /// # Errors
    ///
    /// Returns a device error from closing the stream.
    pub async fn stop_continuous_recording(&self) -> Result<bool> {
        if !self.is_recording() {
            return Ok(false);
        }
        self.recorder
            .wait_for_drain(self.config.drain_timeout(), self.config.drain_poll())
            .await;

        let active = lock(&self.capture).take();
        match active {
            Some(active) => {
                active.stop()?;
                debug!(entity = %self.entity_id, "continuous recording stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn stop_capture(&self) {
        let active = lock(&self.capture).take();
        if let Some(active) = active
            && let Err(e) = active.stop()
        {
            warn!(entity = %self.entity_id, "failed to stop recording: {e}");
        }
    }

    async fn relay_utterance(&self, event: &Event) -> Result<()> {
        let mut utterance: UtterancePayload = event.payload_as()?;
        if utterance.content.is_empty() {
            return Ok(());
        }
        utterance.entity_id = Some(self.entity_id.clone());
        let relayed = Event::new(
            utterance_event_id(&self.entity_id),
            EventType::PerceptionActorUtterance,
            EventStatus::Done,
            serde_json::to_value(utterance)?,
        );
        let reached = self.directory.broadcast_except(&self.entity_id, &relayed).await;
        debug!(entity = %self.entity_id, reached, "utterance relayed");
        Ok(())
    }

    async fn relay_speech_boundary(&self, event: &Event) {
        let relayed = Event::new(
            event.event_id.clone(),
            event.event_type.clone(),
            EventStatus::Done,
            serde_json::json!({ "entity_id": self.entity_id }),
        );
        self.directory.broadcast_except(&self.entity_id, &relayed).await;
    }

    async fn accept_fetch(&self, event: &Event) -> Result<()> {
        if !self.is_recording() {
            warn!(
                entity = %self.entity_id,
                event_id = %event.event_id,
                "microphone fetch while not recording, rejecting"
            );
            return self.recorder.reject(&event.event_id).await;
        }
        let request: FetchMicrophoneRequest = if event.payload.is_null() {
            FetchMicrophoneRequest::default()
        } else {
            event.payload_as()?
        };
        let (start_byte, bytes_count) = self.recorder.accept(&event.event_id, request);
        debug!(
            entity = %self.entity_id,
            event_id = %event.event_id,
            start_byte,
            bytes_count,
            "microphone fetch requested"
        );

        let recorder = Arc::clone(&self.recorder);
        let event_id = event.event_id.clone();
        let entity_id = self.entity_id.clone();
        tokio::spawn(async move {
            if let Err(e) = recorder.serve(&event_id, start_byte, bytes_count).await {
                warn!(entity = %entity_id, event_id, "microphone fetch failed: {e}");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SpeechToTextHandler {
    fn name(&self) -> &str {
        "stt"
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        if event.status != EventStatus::Done {
            return Ok(());
        }
        match event.event_type {
            EventType::SttOutputText => self.relay_utterance(event).await,
            EventType::SttSpeechStarted | EventType::SttSpeechStopped => {
                self.relay_speech_boundary(event).await;
                Ok(())
            }
            EventType::SttFetchMicrophone => self.accept_fetch(event).await,
            _ => Ok(()),
        }
    }

    fn deactivate(&self) {
        self.recorder.abandon();
        self.stop_capture();
        self.listening.store(false, Ordering::SeqCst);
    }
}
