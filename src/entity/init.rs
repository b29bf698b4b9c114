//! Entity initialization handshake.
//!
//! Each entity announces itself with `INIT_ENTITY`; the backend answers on
//! the same connection with `DONE` or a failure status. The scene starts
//! only once every entity has answered and none failed.

use crate::connector::EventHandler;
use crate::error::Result;
use crate::event::{Event, EventStatus, EventType};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{info, warn};

/// Result of the handshake once every entity has answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    AllReady,
    /// Entities whose initialization failed.
    Failed(Vec<String>),
}

#[derive(Debug, Default)]
struct InitProgress {
    ready: Vec<String>,
    failed: Vec<String>,
}

/// Counts init answers across all entities of a session.
#[derive(Clone)]
pub struct InitTracker {
    expected: usize,
    progress: Arc<Mutex<InitProgress>>,
    outcome: watch::Sender<Option<InitOutcome>>,
}

impl InitTracker {
    #[must_use]
    pub fn new(expected: usize) -> Self {
        let initial = (expected == 0).then_some(InitOutcome::AllReady);
        let (outcome, _) = watch::channel(initial);
        Self {
            expected,
            progress: Arc::new(Mutex::new(InitProgress::default())),
            outcome,
        }
    }

    fn progress(&self) -> MutexGuard<'_, InitProgress> {
        match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn mark_ready(&self, entity_id: &str) {
        self.record(entity_id, true);
    }

    pub fn mark_failed(&self, entity_id: &str) {
        self.record(entity_id, false);
    }

    fn record(&self, entity_id: &str, ready: bool) {
        let mut progress = self.progress();
        if progress.ready.iter().chain(&progress.failed).any(|e| e == entity_id) {
            return;
        }
        if ready {
            progress.ready.push(entity_id.to_owned());
        } else {
            progress.failed.push(entity_id.to_owned());
        }
        info!(
            ready = progress.ready.len(),
            failed = progress.failed.len(),
            expected = self.expected,
            "entity init progress"
        );

        if progress.ready.len() + progress.failed.len() == self.expected {
            let outcome = if progress.failed.is_empty() {
                InitOutcome::AllReady
            } else {
                InitOutcome::Failed(progress.failed.clone())
            };
            self.outcome.send_replace(Some(outcome));
        }
    }

    #[must_use]
    pub fn ready(&self) -> Vec<String> {
        self.progress().ready.clone()
    }

    #[must_use]
    pub fn failed(&self) -> Vec<String> {
        self.progress().failed.clone()
    }

    /// Outcome, if every entity has answered.
    #[must_use]
    pub fn outcome(&self) -> Option<InitOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until every entity has answered.
    pub async fn wait(&self) -> InitOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender lives in self, so this cannot close while we wait.
                return InitOutcome::Failed(Vec::new());
            }
        }
    }
}

/// Records the backend's answer to this entity's `INIT_ENTITY` request.
/// Inert after the first answer.
pub struct EntityInitHandler {
    entity_id: String,
    tracker: InitTracker,
    answered: AtomicBool,
}

impl EntityInitHandler {
    pub fn new(entity_id: impl Into<String>, tracker: InitTracker) -> Self {
        Self {
            entity_id: entity_id.into(),
            tracker,
            answered: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for EntityInitHandler {
    fn name(&self) -> &str {
        "init"
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        if event.event_type != EventType::InitEntity || self.answered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if event.status == EventStatus::Done {
            info!(entity = %self.entity_id, "entity initialized");
            self.tracker.mark_ready(&self.entity_id);
        } else {
            warn!(entity = %self.entity_id, status = ?event.status, "entity initialization failed");
            self.tracker.mark_failed(&self.entity_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn answer(status: EventStatus) -> Event {
        Event::new(
            "init_entity",
            EventType::InitEntity,
            status,
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn resolves_when_all_entities_answer() {
        let tracker = InitTracker::new(2);
        let user = EntityInitHandler::new("user", tracker.clone());
        let character = EntityInitHandler::new("character", tracker.clone());

        user.handle_event(&answer(EventStatus::Done)).await.unwrap();
        assert_eq!(tracker.outcome(), None);
        character.handle_event(&answer(EventStatus::Done)).await.unwrap();

        assert_eq!(tracker.wait().await, InitOutcome::AllReady);
        assert_eq!(tracker.ready(), vec!["user", "character"]);
    }

    #[tokio::test]
    async fn any_failure_fails_the_handshake() {
        let tracker = InitTracker::new(2);
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };
        EntityInitHandler::new("user", tracker.clone())
            .handle_event(&answer(EventStatus::Error))
            .await
            .unwrap();
        EntityInitHandler::new("character", tracker.clone())
            .handle_event(&answer(EventStatus::Done))
            .await
            .unwrap();

        assert_eq!(
            waiter.await.unwrap(),
            InitOutcome::Failed(vec!["user".to_owned()])
        );
    }

    #[tokio::test]
    async fn handler_counts_only_its_first_answer() {
        let tracker = InitTracker::new(2);
        let handler = EntityInitHandler::new("user", tracker.clone());
        handler.handle_event(&answer(EventStatus::Done)).await.unwrap();
        handler.handle_event(&answer(EventStatus::Error)).await.unwrap();
        assert!(handler.is_answered());
        assert_eq!(tracker.ready(), vec!["user"]);
        assert!(tracker.failed().is_empty());
        assert_eq!(tracker.outcome(), None);
    }

    #[tokio::test]
    async fn other_events_are_ignored() {
        let tracker = InitTracker::new(1);
        let handler = EntityInitHandler::new("user", tracker.clone());
        let other = Event::new("x", EventType::AiStatus, EventStatus::Done, serde_json::json!({}));
        handler.handle_event(&other).await.unwrap();
        assert!(!handler.is_answered());
    }

    #[test]
    fn empty_scene_is_immediately_ready() {
        assert_eq!(InitTracker::new(0).outcome(), Some(InitOutcome::AllReady));
    }
}
