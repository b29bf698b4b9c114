//! Entities and the directory that links them.
//!
//! An [`EntityController`] owns everything one character or user avatar
//! needs: its connector, its STT/TTS/perception modules and its init
//! handshake. The [`EntityDirectory`] lets an entity's STT module reach the
//! perception module of every sibling.

pub mod init;

pub use init::{EntityInitHandler, InitOutcome, InitTracker};

use crate::audio::capture::AudioInput;
use crate::audio::playback::AudioOutput;
use crate::config::HarmonyConfig;
use crate::connector::{Connector, EventHandler, EventSender, ShutdownFn, Transport};
use crate::error::{HarmonyError, Result};
use crate::event::{Event, EventStatus, EventType};
use crate::lipsync::MouthActuator;
use crate::perception::PerceptionHandler;
use crate::stt::SpeechToTextHandler;
use crate::tts::TextToSpeechHandler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Perception handlers of every live entity, keyed by entity id.
///
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct EntityDirectory {
    entries: Arc<Mutex<Vec<(String, Arc<dyn EventHandler>)>>>,
}

impl EntityDirectory {
    fn entries(&self) -> MutexGuard<'_, Vec<(String, Arc<dyn EventHandler>)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add or replace the perception handler for `entity_id`.
    pub fn insert(&self, entity_id: impl Into<String>, perception: Arc<dyn EventHandler>) {
        let entity_id = entity_id.into();
        let mut entries = self.entries();
        match entries.iter_mut().find(|(id, _)| *id == entity_id) {
            Some(entry) => entry.1 = perception,
            None => entries.push((entity_id, perception)),
        }
    }

    /// Returns true if the entity was present.
    pub fn remove(&self, entity_id: &str) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(id, _)| id != entity_id);
        entries.len() != before
    }

    #[must_use]
    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries().iter().any(|(id, _)| id == entity_id)
    }

    #[must_use]
    pub fn entity_ids(&self) -> Vec<String> {
        self.entries().iter().map(|(id, _)| id.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Deliver `event` to every entity except `origin`, in insertion order.
    /// Returns how many entities it reached.
    ///
    /// Visits every sibling on each call, so the cost grows with the size of
    /// the scene.
    pub async fn broadcast_except(&self, origin: &str, event: &Event) -> usize {
        let targets: Vec<_> = self
            .entries()
            .iter()
            .filter(|(id, _)| id != origin)
            .cloned()
            .collect();

        for (entity_id, perception) in &targets {
            if let Err(e) = perception.handle_event(event).await {
                warn!(
                    from = origin,
                    to = %entity_id,
                    event_type = %event.event_type,
                    "relay failed: {e}"
                );
            }
        }
        targets.len()
    }
}

/// Devices and transport one entity is built on.
#[derive(Clone)]
pub struct EntityDeps {
    pub transport: Arc<dyn Transport>,
    pub input: Arc<dyn AudioInput>,
    pub output: Arc<dyn AudioOutput>,
    pub actuator: Arc<dyn MouthActuator>,
}

/// All modules of one entity.
pub struct EntityController {
    entity_id: String,
    connector: Connector,
    stt: Arc<SpeechToTextHandler>,
    tts: Arc<TextToSpeechHandler>,
    perception: Arc<PerceptionHandler>,
    init: Arc<EntityInitHandler>,
    directory: EntityDirectory,
    active: AtomicBool,
}

impl EntityController {
    /// Build the entity's modules, register them on its connector and add
    /// it to `directory`. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a config error for an unsupported audio format.
    pub fn new(
        entity_id: impl Into<String>,
        config: &HarmonyConfig,
        deps: EntityDeps,
        directory: &EntityDirectory,
        tracker: InitTracker,
        shutdown: ShutdownFn,
    ) -> Result<Self> {
        let entity_id = entity_id.into();
        let connector = Connector::new(entity_id.clone(), deps.transport, shutdown);
        connector.set_queue_warn_depth(config.connector.send_queue_warn_depth);
        let sender: Arc<dyn EventSender> = Arc::new(connector.clone());

        let stt = Arc::new(SpeechToTextHandler::new(
            entity_id.clone(),
            &config.stt,
            Arc::clone(&sender),
            deps.input,
            directory.clone(),
        )?);
        let tts = Arc::new(TextToSpeechHandler::new(
            entity_id.clone(),
            &config.tts,
            deps.output,
            deps.actuator,
            Arc::clone(&sender),
        ));
        let perception = Arc::new(PerceptionHandler::new(
            entity_id.clone(),
            sender,
            tts.engine().clone(),
        ));
        let init = Arc::new(EntityInitHandler::new(entity_id.clone(), tracker));

        connector.register_handler(init.clone());
        connector.register_handler(stt.clone());
        connector.register_handler(tts.clone());
        connector.register_handler(perception.clone());
        directory.insert(entity_id.clone(), perception.clone());

        debug!(entity = %entity_id, "entity modules created");
        Ok(Self {
            entity_id,
            connector,
            stt,
            tts,
            perception,
            init,
            directory: directory.clone(),
            active: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    #[must_use]
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    #[must_use]
    pub fn stt(&self) -> &Arc<SpeechToTextHandler> {
        &self.stt
    }

    #[must_use]
    pub fn tts(&self) -> &Arc<TextToSpeechHandler> {
        &self.tts
    }

    #[must_use]
    pub fn perception(&self) -> &Arc<PerceptionHandler> {
        &self.perception
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Open the entity's connection.
    ///
    /// # Errors
    ///
    /// Returns the connector's transport error.
    pub async fn connect(&self) -> Result<()> {
        self.connector.start().await
    }

    /// Ask the backend to initialize this entity. Does nothing if already
    /// activated.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Entity`] if the init event cannot be sent.
    pub async fn activate(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(entity = %self.entity_id, "initializing entity");
        let event = Event::new(
            "init_entity",
            EventType::InitEntity,
            EventStatus::New,
            serde_json::json!({ "entity_id": self.entity_id }),
        );
        self.connector.send_event(event).await.map_err(|e| {
            HarmonyError::Entity(format!(
                "failed to send init event for entity '{}': {e}",
                self.entity_id
            ))
        })
    }

    /// Drop the init handler once the handshake is over.
    pub fn finish_init(&self) {
        let init: Arc<dyn EventHandler> = self.init.clone();
        self.connector.unregister_handler(&init);
    }

    /// Tell the backend the scene is loaded for this entity. Failures are
    /// logged only.
    pub async fn environment_loaded(&self) {
        let event = Event::new(
            "environment_loaded",
            EventType::EnvironmentLoaded,
            EventStatus::New,
            serde_json::json!({}),
        );
        match self.connector.send_event(event).await {
            Ok(()) => info!(entity = %self.entity_id, "scene finished loading"),
            Err(e) => warn!(entity = %self.entity_id, "failed to report scene loaded: {e}"),
        }
    }

    /// Leave the directory, deactivate every module and stop the connector.
    pub fn shutdown_modules(&self) {
        info!(entity = %self.entity_id, "shutting down entity");
        self.active.store(false, Ordering::SeqCst);
        self.directory.remove(&self.entity_id);
        self.connector.stop();
    }

    /// Wait for the connector loops and playback engine to finish.
    pub async fn join(&self) {
        self.connector.join().await;
        self.tts.join().await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use async_trait::async_trait;

    struct Inbox {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Inbox {
        fn name(&self) -> &str {
            "inbox"
        }

        async fn handle_event(&self, event: &Event) -> Result<()> {
            self.seen.lock().unwrap().push(event.event_id.clone());
            Ok(())
        }
    }

    fn inbox() -> Arc<Inbox> {
        Arc::new(Inbox {
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn broadcast_skips_the_origin() {
        let directory = EntityDirectory::default();
        let (user, alice, bob) = (inbox(), inbox(), inbox());
        directory.insert("user", user.clone());
        directory.insert("alice", alice.clone());
        directory.insert("bob", bob.clone());

        let event = Event::new(
            "e1",
            EventType::SttSpeechStarted,
            EventStatus::Done,
            serde_json::json!({}),
        );
        assert_eq!(directory.broadcast_except("user", &event).await, 2);

        assert!(user.seen.lock().unwrap().is_empty());
        assert_eq!(*alice.seen.lock().unwrap(), vec!["e1"]);
        assert_eq!(*bob.seen.lock().unwrap(), vec!["e1"]);
    }

    #[tokio::test]
    async fn insert_replaces_and_remove_forgets() {
        let directory = EntityDirectory::default();
        let (first, second) = (inbox(), inbox());
        directory.insert("alice", first.clone());
        directory.insert("alice", second.clone());
        assert_eq!(directory.len(), 1);

        let event = Event::new("e", EventType::AiStatus, EventStatus::Done, serde_json::json!({}));
        directory.broadcast_except("user", &event).await;
        assert!(first.seen.lock().unwrap().is_empty());
        assert_eq!(second.seen.lock().unwrap().len(), 1);

        assert!(directory.remove("alice"));
        assert!(!directory.remove("alice"));
        assert!(directory.is_empty());
        assert_eq!(directory.broadcast_except("user", &event).await, 0);
    }
}
