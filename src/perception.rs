//! What an entity perceives from its siblings.
//!
//! Other entities' STT handlers deliver their utterances and speech
//! boundaries here through the [`EntityDirectory`](crate::entity::EntityDirectory).
//! Utterances are forwarded to the backend as this entity's user input;
//! speech boundaries mute and unmute this entity's own speech so it does
//! not talk over whoever is speaking.

use crate::connector::{EventHandler, EventSender};
use crate::error::Result;
use crate::event::{Event, EventStatus, EventType};
use crate::tts::PlaybackEngine;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Event id of forwarded utterances, per listening entity.
#[must_use]
pub fn processed_utterance_event_id(entity_id: &str) -> String {
    format!("actor_{entity_id}_VAD_utterance_processed")
}

/// Entity a relayed event came from, taken from its payload.
fn relay_origin(event: &Event) -> Option<&str> {
    event.payload.get("entity_id")?.as_str()
}

pub struct PerceptionHandler {
    entity_id: String,
    sender: Arc<dyn EventSender>,
    playback: PlaybackEngine,
}

impl PerceptionHandler {
    pub fn new(
        entity_id: impl Into<String>,
        sender: Arc<dyn EventSender>,
        playback: PlaybackEngine,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            sender,
            playback,
        }
    }
}

#[async_trait]
impl EventHandler for PerceptionHandler {
    fn name(&self) -> &str {
        "perception"
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        if event.status != EventStatus::Done {
            return Ok(());
        }
        // Also registered on this entity's own connector: only sibling
        // relays carry another entity's id.
        let Some(origin) = relay_origin(event) else {
            return Ok(());
        };
        if origin == self.entity_id {
            return Ok(());
        }
        match event.event_type {
            EventType::PerceptionActorUtterance => {
                debug!(entity = %self.entity_id, from = origin, "forwarding perceived utterance");
                self.sender
                    .send_event(Event::new(
                        processed_utterance_event_id(&self.entity_id),
                        EventType::UserUtterance,
                        EventStatus::New,
                        event.payload.clone(),
                    ))
                    .await
            }
            EventType::SttSpeechStarted => {
                self.playback.suppress_speech(true);
                Ok(())
            }
            EventType::SttSpeechStopped => {
                self.playback.suppress_speech(false);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
