//! Shared test utilities used by the unit tests and the `tests/` suites.
//!
//! Everything here runs in-process: devices are stand-ins that never touch
//! cpal, and each entity's backend is a task on the far end of a
//! [`MemoryTransport`].

use crate::audio::capture::{ActiveCapture, AudioInput};
use crate::audio::playback::{ActiveOutput, AudioOutput, PlaybackItem};
use crate::audio::ring_buffer::{SharedRingBuffer, lock_ring};
use crate::audio::AudioFormat;
use crate::connector::{MemoryPeer, MemoryTransport};
use crate::entity::EntityDeps;
use crate::error::{HarmonyError, Result};
use crate::event::{Event, EventStatus, EventType};
use crate::lipsync::RecordingMouthActuator;
use crate::session::EntityFactory;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Microphone stand-in. Each start appends `prefill` zero bytes to the ring.
#[derive(Debug, Default)]
pub struct StaticInput {
    prefill: usize,
    starts: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl StaticInput {
    #[must_use]
    pub fn new(prefill: usize) -> Self {
        Self {
            prefill,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct StaticCapture {
    stops: Arc<AtomicUsize>,
}

impl ActiveCapture for StaticCapture {
    fn stop(self: Box<Self>) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl AudioInput for StaticInput {
    fn start(
        &self,
        _format: AudioFormat,
        _stepping_ms: u32,
        ring: SharedRingBuffer,
    ) -> Result<Box<dyn ActiveCapture>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.prefill > 0 {
            lock_ring(&ring).append(&vec![0u8; self.prefill]);
        }
        Ok(Box::new(StaticCapture {
            stops: Arc::clone(&self.stops),
        }))
    }
}

/// Speaker stand-in that finishes every item as soon as it starts.
#[derive(Debug, Default)]
pub struct InstantOutput {
    played: Mutex<Vec<String>>,
}

impl InstantOutput {
    /// Source ids of every item played, in order.
    #[must_use]
    pub fn played(&self) -> Vec<String> {
        match self.played.lock() {
            Ok(p) => p.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }
}

struct FinishedOutput;

impl ActiveOutput for FinishedOutput {
    fn stop(self: Box<Self>) {}
}

impl AudioOutput for InstantOutput {
    fn play(
        &self,
        item: PlaybackItem,
        finished: oneshot::Sender<()>,
    ) -> Result<Box<dyn ActiveOutput>> {
        match self.played.lock() {
            Ok(mut p) => p.push(item.source_id),
            Err(p) => p.into_inner().push(item.source_id),
        }
        let _ = finished.send(());
        Ok(Box::new(FinishedOutput))
    }
}

/// Write a short 16-bit mono silent WAV file.
///
/// # Errors
///
/// Returns [`HarmonyError::Audio`] if the file cannot be written.
pub fn write_silent_wav(path: &Path, frames: usize) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let audio_err = |e: hound::Error| HarmonyError::Audio(format!("cannot write wav: {e}"));
    let mut writer = hound::WavWriter::create(path, spec).map_err(audio_err)?;
    for _ in 0..frames {
        writer.write_sample(0i16).map_err(audio_err)?;
    }
    writer.finalize().map_err(audio_err)
}

enum BackendCommand {
    Push(String),
    ReadError(String),
}

/// In-process backend serving one entity's connection.
///
/// Records every event the connector sends and, if configured, answers
/// `INIT_ENTITY` with a fixed status.
pub struct FakeBackend {
    received: Arc<Mutex<Vec<Event>>>,
    commands: mpsc::UnboundedSender<BackendCommand>,
    task: JoinHandle<()>,
}

impl FakeBackend {
    /// Serve `peer` on the current runtime.
    #[must_use]
    pub fn spawn(mut peer: MemoryPeer, init_reply: Option<EventStatus>) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let log = Arc::clone(&received);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = peer.next_outbound() => {
                        let Some(frame) = frame else { break };
                        let Ok(event) = Event::from_wire(&frame) else { continue };
                        if event.event_type == EventType::InitEntity
                            && let Some(status) = init_reply
                            && let Ok(reply) = Event::new(
                                event.event_id.clone(),
                                EventType::InitEntity,
                                status,
                                event.payload.clone(),
                            )
                            .to_wire()
                        {
                            peer.push(reply);
                        }
                        match log.lock() {
                            Ok(mut l) => l.push(event),
                            Err(p) => p.into_inner().push(event),
                        }
                    }
                    command = command_rx.recv() => match command {
                        Some(BackendCommand::Push(text)) => {
                            peer.push(text);
                        }
                        Some(BackendCommand::ReadError(message)) => {
                            peer.push_read_error(message);
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            received,
            commands,
            task,
        }
    }

    /// Deliver `event` to the connector. Returns false once the backend stopped.
    pub fn push_event(&self, event: &Event) -> bool {
        match event.to_wire() {
            Ok(text) => self.push_raw(text),
            Err(_) => false,
        }
    }

    /// Deliver an arbitrary text frame.
    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        self.commands.send(BackendCommand::Push(text.into())).is_ok()
    }

    /// Make the connector's next read fail.
    pub fn fail_read(&self, message: impl Into<String>) -> bool {
        self.commands
            .send(BackendCommand::ReadError(message.into()))
            .is_ok()
    }

    #[must_use]
    pub fn received(&self) -> Vec<Event> {
        match self.received.lock() {
            Ok(r) => r.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    #[must_use]
    pub fn received_of(&self, event_type: &EventType) -> Vec<Event> {
        self.received()
            .into_iter()
            .filter(|e| &e.event_type == event_type)
            .collect()
    }

    /// Poll until `count` events of `event_type` have arrived.
    pub async fn wait_for(
        &self,
        event_type: &EventType,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<Event>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.received_of(event_type);
            if events.len() >= count {
                return Some(events);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Whether the connection has been torn down.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// [`EntityFactory`] backed by memory transports and stand-in devices.
pub struct MemoryFactory {
    transports: Mutex<HashMap<String, MemoryTransport>>,
    input: Arc<StaticInput>,
    output: Arc<InstantOutput>,
    actuators: Mutex<HashMap<String, RecordingMouthActuator>>,
}

impl MemoryFactory {
    /// Build a factory for `entity_ids` and spawn one [`FakeBackend`] per
    /// entity, answering init with `init_reply`.
    #[must_use]
    pub fn new(
        entity_ids: &[String],
        init_reply: Option<EventStatus>,
        input: Arc<StaticInput>,
    ) -> (Self, HashMap<String, FakeBackend>) {
        let mut transports = HashMap::new();
        let mut backends = HashMap::new();
        for entity_id in entity_ids {
            let (transport, peer) = MemoryTransport::pair();
            transports.insert(entity_id.clone(), transport);
            backends.insert(entity_id.clone(), FakeBackend::spawn(peer, init_reply));
        }
        (
            Self {
                transports: Mutex::new(transports),
                input,
                output: Arc::new(InstantOutput::default()),
                actuators: Mutex::new(HashMap::new()),
            },
            backends,
        )
    }

    /// Make `entity_id` fail to connect.
    pub fn set_unreachable(&self, entity_id: &str) {
        let mut transports = match self.transports.lock() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        transports.insert(
            entity_id.to_owned(),
            MemoryTransport::unreachable("connection refused"),
        );
    }

    #[must_use]
    pub fn output(&self) -> &Arc<InstantOutput> {
        &self.output
    }

    /// Mouth values sent for `entity_id`, if it was built.
    #[must_use]
    pub fn actuator(&self, entity_id: &str) -> Option<RecordingMouthActuator> {
        match self.actuators.lock() {
            Ok(a) => a.get(entity_id).cloned(),
            Err(p) => p.into_inner().get(entity_id).cloned(),
        }
    }
}

impl EntityFactory for MemoryFactory {
    fn deps(&self, entity_id: &str) -> Result<EntityDeps> {
        let transport = match self.transports.lock() {
            Ok(mut t) => t.remove(entity_id),
            Err(p) => p.into_inner().remove(entity_id),
        }
        .ok_or_else(|| HarmonyError::Config(format!("no transport for entity '{entity_id}'")))?;

        let actuator = RecordingMouthActuator::default();
        match self.actuators.lock() {
            Ok(mut a) => a.insert(entity_id.to_owned(), actuator.clone()),
            Err(p) => p.into_inner().insert(entity_id.to_owned(), actuator.clone()),
        };

        Ok(EntityDeps {
            transport: Arc::new(transport),
            input: self.input.clone(),
            output: self.output.clone(),
            actuator: Arc::new(actuator),
        })
    }
}
