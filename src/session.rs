//! Multi-entity session lifecycle.
//!
//! Startup runs in fixed phases: build every entity (user first), open
//! every connection, wait out the warmup, send each entity's init request,
//! wait for all answers, report the scene as loaded, and optionally start
//! listening on the user entity. After that the session supervises: a
//! connector that fails fatally reports its entity here, and the entity
//! (or, by default, the whole session) is torn down.

use crate::config::HarmonyConfig;
use crate::connector::ShutdownFn;
use crate::entity::{EntityController, EntityDeps, EntityDirectory, InitOutcome, InitTracker};
use crate::error::{HarmonyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Supplies the transport and devices for each entity.
pub trait EntityFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if a device or endpoint for `entity_id` is unusable.
    fn deps(&self, entity_id: &str) -> Result<EntityDeps>;
}

/// A configured session that has not started yet.
pub struct HarmonySession {
    config: HarmonyConfig,
    factory: Arc<dyn EntityFactory>,
}

/// A session whose entities are initialized and running.
pub struct RunningSession {
    controllers: Vec<EntityController>,
    directory: EntityDirectory,
    user_entity_id: String,
    shutdown_on_entity_failure: bool,
    failures: mpsc::UnboundedReceiver<String>,
}

async fn teardown(controllers: &[EntityController]) {
    for controller in controllers {
        controller.shutdown_modules();
    }
    for controller in controllers {
        controller.join().await;
    }
}

impl HarmonySession {
    #[must_use]
    pub fn new(config: HarmonyConfig, factory: Arc<dyn EntityFactory>) -> Self {
        Self { config, factory }
    }

    /// Start and supervise until `cancel` fires or an entity failure ends
    /// the session.
    ///
    /// # Errors
    ///
    /// Returns the startup error, or [`HarmonyError::Entity`] when an entity
    /// failure shut the session down.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        match self.start(&cancel).await? {
            Some(running) => running.supervise(cancel).await,
            None => Ok(()),
        }
    }

    /// Bring every entity up. Returns `None` if `cancel` fired first.
    ///
    /// # Errors
    ///
    /// Config, transport, device and init-handshake errors. Everything
    /// already started is torn down before the error is returned.
    pub async fn start(self, cancel: &CancellationToken) -> Result<Option<RunningSession>> {
        let config = self.config;
        config.validate()?;

        let entity_ids = config.scene.entity_ids();
        let user_entity_id = entity_ids[0].clone();
        let directory = EntityDirectory::default();
        let tracker = InitTracker::new(entity_ids.len());
        let (failure_tx, mut failures) = mpsc::unbounded_channel::<String>();

        let mut controllers = Vec::with_capacity(entity_ids.len());
        for entity_id in &entity_ids {
            let deps = match self.factory.deps(entity_id) {
                Ok(deps) => deps,
                Err(e) => {
                    teardown(&controllers).await;
                    return Err(e);
                }
            };
            let shutdown: ShutdownFn = {
                let tx = failure_tx.clone();
                let entity_id = entity_id.clone();
                Arc::new(move || {
                    let _ = tx.send(entity_id.clone());
                })
            };
            match EntityController::new(
                entity_id.clone(),
                &config,
                deps,
                &directory,
                tracker.clone(),
                shutdown,
            ) {
                Ok(controller) => controllers.push(controller),
                Err(e) => {
                    teardown(&controllers).await;
                    return Err(e);
                }
            }
        }
        drop(failure_tx);

        for controller in &controllers {
            if let Err(e) = controller.connect().await {
                error!(entity = controller.entity_id(), "cannot connect to Harmony Link: {e}");
                teardown(&controllers).await;
                return Err(e);
            }
        }

        let warmup = Duration::from_secs(config.harmony.start_warmup_secs);
        tokio::select! {
            () = cancel.cancelled() => {
                teardown(&controllers).await;
                return Ok(None);
            }
            () = tokio::time::sleep(warmup) => {}
        }

        for controller in &controllers {
            if let Err(e) = controller.activate().await {
                error!("{e}");
                teardown(&controllers).await;
                return Err(e);
            }
        }

        let init_timeout = Duration::from_secs(config.harmony.init_timeout_secs);
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                teardown(&controllers).await;
                return Ok(None);
            }
            Some(failed) = failures.recv() => {
                teardown(&controllers).await;
                return Err(HarmonyError::Entity(format!(
                    "entity '{failed}' lost its connection during initialization"
                )));
            }
            outcome = tokio::time::timeout(init_timeout, tracker.wait()) => outcome,
        };
        match outcome {
            Ok(InitOutcome::AllReady) => {
                info!(entities = controllers.len(), "all entities initialized");
            }
            Ok(InitOutcome::Failed(failed)) => {
                teardown(&controllers).await;
                return Err(HarmonyError::Entity(format!(
                    "entity initialization failed: {}",
                    failed.join(", ")
                )));
            }
            Err(_) => {
                teardown(&controllers).await;
                return Err(HarmonyError::Entity(format!(
                    "entity initialization timed out after {}s ({} of {} answered)",
                    init_timeout.as_secs(),
                    tracker.ready().len() + tracker.failed().len(),
                    controllers.len()
                )));
            }
        }

        for controller in &controllers {
            controller.finish_init();
            controller.environment_loaded().await;
        }

        if config.stt.listen_on_start
            && let Some(user) = controllers.iter().find(|c| c.entity_id() == user_entity_id)
            && let Err(e) = user.stt().start_listen().await
        {
            error!(entity = %user_entity_id, "cannot start listening: {e}");
            teardown(&controllers).await;
            return Err(e);
        }

        info!("session running");
        Ok(Some(RunningSession {
            controllers,
            directory,
            user_entity_id,
            shutdown_on_entity_failure: config.harmony.shutdown_on_entity_failure,
            failures,
        }))
    }
}

impl RunningSession {
    #[must_use]
    pub fn entity(&self, entity_id: &str) -> Option<&EntityController> {
        self.controllers.iter().find(|c| c.entity_id() == entity_id)
    }

    /// The entity that owns the microphone.
    #[must_use]
    pub fn user(&self) -> Option<&EntityController> {
        self.entity(&self.user_entity_id)
    }

    #[must_use]
    pub fn entity_ids(&self) -> Vec<String> {
        self.controllers.iter().map(|c| c.entity_id().to_owned()).collect()
    }

    #[must_use]
    pub fn directory(&self) -> &EntityDirectory {
        &self.directory
    }

    /// Handle entity failures until `cancel` fires, then shut down.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Entity`] if a failure ended the session.
    pub async fn supervise(mut self, cancel: CancellationToken) -> Result<()> {
        loop {
            let failed = tokio::select! {
                () = cancel.cancelled() => break,
                failed = self.failures.recv() => match failed {
                    Some(id) => id,
                    None => break,
                },
            };

            error!(entity = %failed, "entity connection failed");
            let Some(index) = self.controllers.iter().position(|c| c.entity_id() == failed)
            else {
                continue;
            };
            let controller = self.controllers.remove(index);
            controller.shutdown_modules();
            controller.join().await;

            if self.shutdown_on_entity_failure {
                warn!("shutting down session after entity failure");
                self.shutdown().await;
                return Err(HarmonyError::Entity(format!("entity '{failed}' failed")));
            }
            if self.controllers.is_empty() {
                return Err(HarmonyError::Entity("no entities left".into()));
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every entity and wait for its tasks.
    pub async fn shutdown(&mut self) {
        if let Some(user) = self.user()
            && let Err(e) = user.stt().stop_listen().await
        {
            warn!("stop listen during shutdown failed: {e}");
        }
        teardown(&self.controllers).await;
        self.controllers.clear();
        info!("session stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::event::{EventStatus, EventType};
    use crate::test_utils::{MemoryFactory, StaticInput};

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> HarmonyConfig {
        let mut config = HarmonyConfig::default();
        config.harmony.start_warmup_secs = 0;
        config.harmony.init_timeout_secs = 5;
        config.stt.listen_on_start = false;
        config
    }

    fn session(
        config: HarmonyConfig,
        init_reply: Option<EventStatus>,
    ) -> (
        HarmonySession,
        Arc<MemoryFactory>,
        std::collections::HashMap<String, crate::test_utils::FakeBackend>,
    ) {
        let ids = config.scene.entity_ids();
        let (factory, backends) =
            MemoryFactory::new(&ids, init_reply, Arc::new(StaticInput::new(0)));
        let factory = Arc::new(factory);
        (
            HarmonySession::new(config, factory.clone()),
            factory,
            backends,
        )
    }

    #[tokio::test]
    async fn startup_initializes_every_entity_then_loads_environment() {
        let (session, _factory, backends) = session(config(), Some(EventStatus::Done));
        let cancel = CancellationToken::new();
        let running = session.start(&cancel).await.unwrap().expect("not cancelled");

        assert_eq!(running.entity_ids(), vec!["user", "character"]);
        assert_eq!(running.directory().len(), 2);
        assert_eq!(running.user().unwrap().entity_id(), "user");

        for (entity_id, backend) in &backends {
            let init = backend.received_of(&EventType::InitEntity);
            assert_eq!(init.len(), 1, "{entity_id}");
            assert_eq!(init[0].event_id, "init_entity");
            assert_eq!(init[0].payload, serde_json::json!({ "entity_id": entity_id }));
            let loaded = backend
                .wait_for(&EventType::EnvironmentLoaded, 1, WAIT)
                .await
                .expect("environment loaded");
            assert_eq!(loaded[0].event_id, "environment_loaded");
        }

        cancel.cancel();
        running.supervise(cancel).await.unwrap();
    }

    #[tokio::test]
    async fn failed_init_answer_aborts_startup() {
        let (session, _factory, backends) = session(config(), Some(EventStatus::Error));
        let err = session.start(&CancellationToken::new()).await;
        assert!(matches!(err, Err(HarmonyError::Entity(_))));
        for backend in backends.values() {
            assert!(backend.received_of(&EventType::EnvironmentLoaded).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_init_times_out() {
        let (session, _factory, _backends) = session(config(), None);
        let err = session.start(&CancellationToken::new()).await;
        match err {
            Err(HarmonyError::Entity(message)) => assert!(message.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other.map(|r| r.is_some())),
        }
    }

    #[tokio::test]
    async fn unreachable_backend_fails_startup() {
        let (session, factory, _backends) = session(config(), Some(EventStatus::Done));
        factory.set_unreachable("character");
        assert!(session.start(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn cancel_during_warmup_returns_none() {
        let mut cfg = config();
        cfg.harmony.start_warmup_secs = 60;
        let (session, _factory, backends) = session(cfg, Some(EventStatus::Done));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(session.start(&cancel).await.unwrap().is_none());
        assert!(backends["user"].received_of(&EventType::InitEntity).is_empty());
    }

    #[tokio::test]
    async fn listen_on_start_opens_the_user_microphone() {
        let mut cfg = config();
        cfg.stt.listen_on_start = true;
        let (session, _factory, backends) = session(cfg, Some(EventStatus::Done));
        let cancel = CancellationToken::new();
        let running = session.start(&cancel).await.unwrap().unwrap();

        assert!(running.user().unwrap().stt().is_listening());
        let listen = backends["user"]
            .wait_for(&EventType::SttStartListen, 1, WAIT)
            .await
            .expect("start listen sent");
        assert_eq!(listen[0].event_id, "start_listen");
        assert!(backends["character"].received_of(&EventType::SttStartListen).is_empty());

        cancel.cancel();
        running.supervise(cancel).await.unwrap();
        assert!(
            backends["user"]
                .wait_for(&EventType::SttStopListen, 1, WAIT)
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn entity_failure_ends_the_session_by_default() {
        let (session, _factory, backends) = session(config(), Some(EventStatus::Done));
        let cancel = CancellationToken::new();
        let running = session.start(&cancel).await.unwrap().unwrap();

        backends["character"].fail_read("connection reset");
        let result = tokio::time::timeout(WAIT, running.supervise(cancel)).await;
        assert!(matches!(result, Ok(Err(HarmonyError::Entity(_)))));
    }

    #[tokio::test]
    async fn entity_failure_can_leave_siblings_running() {
        let mut cfg = config();
        cfg.harmony.shutdown_on_entity_failure = false;
        let (session, _factory, backends) = session(cfg, Some(EventStatus::Done));
        let cancel = CancellationToken::new();
        let running = session.start(&cancel).await.unwrap().unwrap();
        let directory = running.directory().clone();
        let supervisor = tokio::spawn(running.supervise(cancel.clone()));

        backends["character"].fail_read("connection reset");
        for _ in 0..400 {
            if !directory.contains("character") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!directory.contains("character"));
        assert!(directory.contains("user"));
        assert!(!supervisor.is_finished());

        cancel.cancel();
        supervisor.await.unwrap().unwrap();
        assert!(directory.is_empty());
    }
}
