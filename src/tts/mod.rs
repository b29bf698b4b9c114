//! Speech output for one entity.
//!
//! The backend synthesizes speech to a WAV file and announces it with an
//! `AI_SPEECH` or `AI_ACTION` event. [`TextToSpeechHandler`] decodes the
//! file off the async threads and queues it on the entity's
//! [`PlaybackEngine`]; every file is eventually acknowledged with
//! `TTS_PLAYBACK_DONE` so the backend can delete it.

pub mod decode;
pub mod engine;

pub use decode::{decode_wav, decode_wav_file};
pub use engine::{
    PLAYBACK_DONE_EVENT_ID, PlaybackEngine, PlaybackState, PlaybackStatus, playback_done_event,
};

use crate::audio::playback::AudioOutput;
use crate::config::TtsConfig;
use crate::connector::{EventHandler, EventSender};
use crate::error::Result;
use crate::event::{Event, EventStatus, EventType, SpeechPayload};
use crate::lipsync::MouthActuator;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// TTS module of one entity.
pub struct TextToSpeechHandler {
    entity_id: String,
    engine: PlaybackEngine,
    engine_task: Mutex<Option<JoinHandle<()>>>,
    sender: Arc<dyn EventSender>,
}

impl TextToSpeechHandler {
    /// Create the handler and spawn its playback engine on the current
    /// runtime.
    pub fn new(
        entity_id: impl Into<String>,
        config: &TtsConfig,
        output: Arc<dyn AudioOutput>,
        actuator: Arc<dyn MouthActuator>,
        sender: Arc<dyn EventSender>,
    ) -> Self {
        let entity_id = entity_id.into();
        let (engine, task) = PlaybackEngine::spawn(
            entity_id.clone(),
            output,
            actuator,
            Arc::clone(&sender),
            config.lipsync_interval(),
        );
        Self {
            entity_id,
            engine,
            engine_task: Mutex::new(Some(task)),
            sender,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    /// See [`PlaybackEngine::suppress_speech`].
    pub fn suppress_speech(&self, suppress: bool) {
        self.engine.suppress_speech(suppress);
    }

    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.engine.is_suppressed()
    }

    /// Wait for the engine task to exit after deactivation.
    pub async fn join(&self) {
        let task = match self.engine_task.lock() {
            Ok(mut t) => t.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(entity = %self.entity_id, "playback engine task failed: {e}");
        }
    }

    async fn on_speech(&self, event: &Event) -> Result<()> {
        let speech: SpeechPayload = if event.payload.is_null() {
            SpeechPayload::default()
        } else {
            event.payload_as()?
        };
        if speech.audio_file.is_empty() {
            return Ok(());
        }

        if self.engine.is_suppressed() {
            debug!(
                entity = %self.entity_id,
                file = %speech.audio_file,
                "speech suppressed, ignoring utterance"
            );
            return self
                .sender
                .send_event(playback_done_event(&speech.audio_file))
                .await;
        }

        let path = speech.audio_file.clone();
        let decoded = tokio::task::spawn_blocking(move || decode_wav_file(&path)).await;
        match decoded {
            Ok(Ok(item)) => {
                debug!(
                    entity = %self.entity_id,
                    file = %speech.audio_file,
                    frames = item.frames(),
                    "loaded speech"
                );
                self.engine.enqueue(item)
            }
            Ok(Err(e)) => {
                warn!(entity = %self.entity_id, "cannot play speech: {e}");
                self.sender
                    .send_event(playback_done_event(&speech.audio_file))
                    .await
            }
            Err(e) => {
                warn!(entity = %self.entity_id, "speech decode task failed: {e}");
                self.sender
                    .send_event(playback_done_event(&speech.audio_file))
                    .await
            }
        }
    }
}

#[async_trait]
impl EventHandler for TextToSpeechHandler {
    fn name(&self) -> &str {
        "tts"
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        if event.status != EventStatus::Done {
            return Ok(());
        }
        match &event.event_type {
            EventType::AiStatus => {
                debug!(entity = %self.entity_id, status = %event.payload, "AI status");
                Ok(())
            }
            t if t.is_speech() => self.on_speech(event).await,
            _ => Ok(()),
        }
    }

    fn deactivate(&self) {
        self.engine.shutdown();
    }
}
