//! Single-flight speech playback with lipsync.
//!
//! One engine task per entity owns the pending queue and at most one active
//! output stream. Everything reaches it through a command channel, so the
//! state machine never needs a lock:
//!
//! ```text
//! Idle -> Loading -> Playing -> Idle      (finished, next item popped)
//!            \          \
//!             +----------+--> Idle        (suppressed)
//! ```
//!
//! Completion is a oneshot fired by the output callback after its last
//! frame. While a stream plays, a ticker draws a lipsync sample every
//! interval and hands it to the mouth actuator.

use crate::audio::playback::{ActiveOutput, AudioOutput, PlaybackItem};
use crate::connector::EventSender;
use crate::error::{HarmonyError, Result};
use crate::event::{Event, EventStatus, EventType};
use crate::lipsync::{MouthActuator, lipsync_sample};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Event id used for every playback-done acknowledgement.
pub const PLAYBACK_DONE_EVENT_ID: &str = "playback_done";

/// Build the acknowledgement that lets the backend delete `source_id`.
#[must_use]
pub fn playback_done_event(source_id: &str) -> Event {
    Event::new(
        PLAYBACK_DONE_EVENT_ID,
        EventType::TtsPlaybackDone,
        EventStatus::New,
        serde_json::Value::String(source_id.to_owned()),
    )
}

/// Engine state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    /// Output stream for the head item is being opened.
    Loading,
    Playing,
}

/// Snapshot returned by [`PlaybackEngine::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub active: Option<String>,
    pub pending: Vec<String>,
    pub suppressed: bool,
}

enum EngineCommand {
    Enqueue(PlaybackItem),
    Suppress(bool),
    Status(oneshot::Sender<PlaybackStatus>),
}

/// Handle to a running playback engine. Clones drive the same engine.
#[derive(Clone)]
pub struct PlaybackEngine {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    suppressed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PlaybackEngine {
    /// Spawn the engine task on the current runtime.
    pub fn spawn(
        entity_id: impl Into<String>,
        output: Arc<dyn AudioOutput>,
        actuator: Arc<dyn MouthActuator>,
        sender: Arc<dyn EventSender>,
        lipsync_interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let suppressed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task = EngineTask {
            entity_id: entity_id.into(),
            output,
            actuator,
            sender,
            lipsync_interval: lipsync_interval.max(Duration::from_millis(1)),
            suppressed: Arc::clone(&suppressed),
            queue: VecDeque::new(),
            active: Active::Idle,
        };
        let handle = tokio::spawn(task.run(cmd_rx, cancel.clone()));

        (
            Self {
                cmd_tx,
                suppressed,
                cancel,
            },
            handle,
        )
    }

    /// Queue an utterance; playback starts at once if idle.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Channel`] if the engine has shut down.
    pub fn enqueue(&self, item: PlaybackItem) -> Result<()> {
        self.send(EngineCommand::Enqueue(item))
    }

    /// Turn speech suppression on or off. Turning it on stops whatever is
    /// playing and discards the queue.
    pub fn suppress_speech(&self, suppress: bool) {
        // Published before the engine sees the command so callers deciding
        // whether to decode new audio observe it immediately.
        self.suppressed.store(suppress, Ordering::SeqCst);
        if let Err(e) = self.send(EngineCommand::Suppress(suppress)) {
            debug!("suppress ignored: {e}");
        }
    }

    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// Current state, active item and queue.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Channel`] if the engine has shut down.
    pub async fn status(&self) -> Result<PlaybackStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Status(tx))?;
        rx.await
            .map_err(|_| HarmonyError::Channel("playback engine stopped".into()))
    }

    /// Stop the active stream, close the mouth and end the engine task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| HarmonyError::Channel("playback engine stopped".into()))
    }
}

type StreamSetup = JoinHandle<Result<Box<dyn ActiveOutput>>>;

enum Active {
    Idle,
    Loading {
        source_id: String,
        setup: StreamSetup,
        finished: oneshot::Receiver<()>,
    },
    Playing {
        source_id: String,
        stream: Box<dyn ActiveOutput>,
        finished: oneshot::Receiver<()>,
    },
}

enum Progress {
    Loaded(Result<Box<dyn ActiveOutput>>),
    Finished,
}

/// Resolves when the active item changes phase; never while idle.
async fn progress(active: &mut Active) -> Progress {
    match active {
        Active::Idle => std::future::pending().await,
        Active::Loading { setup, .. } => Progress::Loaded(match setup.await {
            Ok(result) => result,
            Err(e) => Err(HarmonyError::Audio(format!("stream setup task failed: {e}"))),
        }),
        Active::Playing { finished, .. } => {
            // A dropped sender means the stream died; treat it as finished.
            let _ = finished.await;
            Progress::Finished
        }
    }
}

struct EngineTask {
    entity_id: String,
    output: Arc<dyn AudioOutput>,
    actuator: Arc<dyn MouthActuator>,
    sender: Arc<dyn EventSender>,
    lipsync_interval: Duration,
    suppressed: Arc<AtomicBool>,
    queue: VecDeque<PlaybackItem>,
    active: Active,
}

impl EngineTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.lipsync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rng = StdRng::from_entropy();

        loop {
            let playing = matches!(self.active, Active::Playing { .. });
            tokio::select! {
                () = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                step = progress(&mut self.active) => match step {
                    Progress::Loaded(result) => self.on_loaded(result),
                    Progress::Finished => self.on_finished(),
                },
                _ = ticker.tick(), if playing => {
                    self.actuator.set_mouth_open(lipsync_sample(&mut rng));
                }
            }
        }

        self.halt();
        debug!(entity = %self.entity_id, "playback engine stopped");
    }

    fn on_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Enqueue(item) => {
                if self.suppressed.load(Ordering::SeqCst) {
                    debug!(
                        entity = %self.entity_id,
                        source = %item.source_id,
                        "speech suppressed, skipping"
                    );
                    self.acknowledge(&item.source_id);
                    return;
                }
                self.queue.push_back(item);
                self.play_next();
            }
            EngineCommand::Suppress(suppress) => {
                self.suppressed.store(suppress, Ordering::SeqCst);
                if suppress {
                    let dropped = self.queue.len();
                    self.queue.clear();
                    if self.halt() || dropped > 0 {
                        info!(entity = %self.entity_id, dropped, "speech suppressed");
                    }
                }
            }
            EngineCommand::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> PlaybackStatus {
        let (state, active) = match &self.active {
            Active::Idle => (PlaybackState::Idle, None),
            Active::Loading { source_id, .. } => (PlaybackState::Loading, Some(source_id.clone())),
            Active::Playing { source_id, .. } => (PlaybackState::Playing, Some(source_id.clone())),
        };
        PlaybackStatus {
            state,
            active,
            pending: self.queue.iter().map(|i| i.source_id.clone()).collect(),
            suppressed: self.suppressed.load(Ordering::SeqCst),
        }
    }

    /// Start the head of the queue unless something is already active.
    fn play_next(&mut self) {
        if !matches!(self.active, Active::Idle) {
            return;
        }
        let Some(item) = self.queue.pop_front() else {
            return;
        };

        let source_id = item.source_id.clone();
        let (done_tx, finished) = oneshot::channel();
        let output = Arc::clone(&self.output);
        let setup = tokio::task::spawn_blocking(move || output.play(item, done_tx));
        debug!(entity = %self.entity_id, source = %source_id, "loading utterance");
        self.active = Active::Loading {
            source_id,
            setup,
            finished,
        };
    }

    fn on_loaded(&mut self, result: Result<Box<dyn ActiveOutput>>) {
        let Active::Loading {
            source_id,
            finished,
            ..
        } = std::mem::replace(&mut self.active, Active::Idle)
        else {
            return;
        };

        match result {
            Ok(stream) => {
                debug!(entity = %self.entity_id, source = %source_id, "playing utterance");
                self.active = Active::Playing {
                    source_id,
                    stream,
                    finished,
                };
            }
            Err(e) => {
                error!(entity = %self.entity_id, source = %source_id, "playback failed: {e}");
                self.acknowledge(&source_id);
                self.play_next();
            }
        }
    }

    fn on_finished(&mut self) {
        let Active::Playing {
            source_id, stream, ..
        } = std::mem::replace(&mut self.active, Active::Idle)
        else {
            return;
        };
        debug!(entity = %self.entity_id, source = %source_id, "done playing");
        self.acknowledge(&source_id);
        stream.stop();
        self.actuator.set_mouth_open(0.0);
        self.play_next();
    }

    /// Drop whatever is active and close the mouth. Returns true if
    /// something was active.
    fn halt(&mut self) -> bool {
        match std::mem::replace(&mut self.active, Active::Idle) {
            Active::Idle => false,
            Active::Loading { setup, .. } => {
                // The stream may already be open; stop it once setup returns.
                let entity_id = self.entity_id.clone();
                tokio::spawn(async move {
                    match setup.await {
                        Ok(Ok(stream)) => stream.stop(),
                        Ok(Err(_)) => {}
                        Err(e) => warn!(entity = %entity_id, "stream setup task failed: {e}"),
                    }
                });
                self.actuator.set_mouth_open(0.0);
                true
            }
            Active::Playing { stream, .. } => {
                stream.stop();
                self.actuator.set_mouth_open(0.0);
                true
            }
        }
    }

    /// Tell the backend `source_id` is no longer needed.
    fn acknowledge(&self, source_id: &str) {
        let sender = Arc::clone(&self.sender);
        let event = playback_done_event(source_id);
        let entity_id = self.entity_id.clone();
        tokio::spawn(async move {
            if let Err(e) = sender.send_event(event).await {
                warn!(entity = %entity_id, "failed to send playback done: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::connector::RecordingSender;
    use crate::lipsync::RecordingMouthActuator;
    use std::sync::Mutex;

    /// Output whose streams only finish when the test says so.
    #[derive(Default)]
    struct ManualOutput {
        started: Mutex<Vec<String>>,
        stopped: Arc<Mutex<Vec<String>>>,
        finishers: Mutex<Vec<oneshot::Sender<()>>>,
    }

    struct ManualStream {
        source_id: String,
        stopped: Arc<Mutex<Vec<String>>>,
    }

    impl ActiveOutput for ManualStream {
        fn stop(self: Box<Self>) {
            self.stopped.lock().unwrap().push(self.source_id);
        }
    }

    impl AudioOutput for ManualOutput {
        fn play(
            &self,
            item: PlaybackItem,
            finished: oneshot::Sender<()>,
        ) -> Result<Box<dyn ActiveOutput>> {
            self.started.lock().unwrap().push(item.source_id.clone());
            self.finishers.lock().unwrap().push(finished);
            Ok(Box::new(ManualStream {
                source_id: item.source_id,
                stopped: Arc::clone(&self.stopped),
            }))
        }
    }

    impl ManualOutput {
        fn finish_current(&self) {
            let tx = self.finishers.lock().unwrap().pop().expect("a stream is playing");
            tx.send(()).unwrap();
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    fn item(name: &str) -> PlaybackItem {
        PlaybackItem {
            source_id: name.into(),
            samples: vec![0.0; 16],
            sample_rate: 16_000,
            channels: 1,
        }
    }

    async fn settle(engine: &PlaybackEngine, want: PlaybackState) -> PlaybackStatus {
        for _ in 0..200 {
            let status = engine.status().await.unwrap();
            if status.state == want {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("engine never reached {want:?}");
    }

    struct Harness {
        engine: PlaybackEngine,
        output: Arc<ManualOutput>,
        mouth: RecordingMouthActuator,
        sender: RecordingSender,
    }

    fn harness() -> Harness {
        let output = Arc::new(ManualOutput::default());
        let mouth = RecordingMouthActuator::default();
        let sender = RecordingSender::default();
        let (engine, _task) = PlaybackEngine::spawn(
            "character",
            output.clone(),
            Arc::new(mouth.clone()),
            Arc::new(sender.clone()),
            Duration::from_millis(100),
        );
        Harness {
            engine,
            output,
            mouth,
            sender,
        }
    }

    #[tokio::test]
    async fn plays_queue_in_fifo_order() {
        let h = harness();
        for name in ["a.wav", "b.wav", "c.wav", "d.wav"] {
            h.engine.enqueue(item(name)).unwrap();
        }

        let status = settle(&h.engine, PlaybackState::Playing).await;
        assert_eq!(status.active.as_deref(), Some("a.wav"));
        assert_eq!(status.pending, vec!["b.wav", "c.wav", "d.wav"]);

        for next in ["b.wav", "c.wav", "d.wav"] {
            h.output.finish_current();
            let status = loop {
                let s = settle(&h.engine, PlaybackState::Playing).await;
                if s.active.as_deref() == Some(next) {
                    break s;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            };
            assert_eq!(status.active.as_deref(), Some(next));
        }
        h.output.finish_current();
        settle(&h.engine, PlaybackState::Idle).await;

        assert_eq!(h.output.started(), vec!["a.wav", "b.wav", "c.wav", "d.wav"]);
        assert_eq!(h.mouth.last(), Some(0.0));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let acks: Vec<_> = h
            .sender
            .events_of(&EventType::TtsPlaybackDone)
            .into_iter()
            .map(|e| e.payload.as_str().unwrap().to_owned())
            .collect();
        assert_eq!(acks, vec!["a.wav", "b.wav", "c.wav", "d.wav"]);
    }

    #[tokio::test]
    async fn suppression_stops_playback_and_empties_queue() {
        let h = harness();
        for name in ["a.wav", "b.wav", "c.wav"] {
            h.engine.enqueue(item(name)).unwrap();
        }
        settle(&h.engine, PlaybackState::Playing).await;

        h.engine.suppress_speech(true);
        let status = settle(&h.engine, PlaybackState::Idle).await;
        assert!(status.pending.is_empty());
        assert!(status.suppressed);
        assert_eq!(h.output.stopped.lock().unwrap().clone(), vec!["a.wav"]);
        assert_eq!(h.mouth.last(), Some(0.0));

        // While suppressed, new speech is acknowledged without playing.
        h.engine.enqueue(item("late.wav")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.output.started(), vec!["a.wav"]);
        let acks = h.sender.events_of(&EventType::TtsPlaybackDone);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].payload, serde_json::json!("late.wav"));

        h.engine.suppress_speech(false);
        h.engine.enqueue(item("after.wav")).unwrap();
        let status = settle(&h.engine, PlaybackState::Playing).await;
        assert_eq!(status.active.as_deref(), Some("after.wav"));
    }

    #[tokio::test]
    async fn suppress_while_idle_only_sets_flag() {
        let h = harness();
        h.engine.suppress_speech(true);
        let status = h.engine.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Idle);
        assert!(status.suppressed);
        assert!(h.mouth.values().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lipsync_ticks_while_playing() {
        let h = harness();
        h.engine.enqueue(item("a.wav")).unwrap();
        settle(&h.engine, PlaybackState::Playing).await;

        let before = h.mouth.values().len();
        tokio::time::sleep(Duration::from_millis(550)).await;
        let values = h.mouth.values();
        assert!(values.len() >= before + 4, "expected lipsync ticks, got {values:?}");
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[tokio::test]
    async fn shutdown_stops_active_stream() {
        let h = harness();
        h.engine.enqueue(item("a.wav")).unwrap();
        settle(&h.engine, PlaybackState::Playing).await;
        h.engine.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.output.stopped.lock().unwrap().clone(), vec!["a.wav"]);
        assert!(h.engine.status().await.is_err());
    }
}
