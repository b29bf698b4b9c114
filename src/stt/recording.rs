//! Byte-range fetches against the live capture ring buffer.
//!
//! The backend asks for microphone audio by absolute byte offset. A request
//! for bytes that have not been captured yet waits, at the known capture
//! rate, until they have; the result goes back as base64 PCM.

use crate::audio::AudioFormat;
use crate::audio::ring_buffer::{RangeRead, SharedRingBuffer, lock_ring};
use crate::connector::EventSender;
use crate::error::{HarmonyError, Result};
use crate::event::{
    Event, EventStatus, EventType, FetchMicrophoneRequest, FetchMicrophoneResult,
};
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Seconds of audio returned when a fetch request omits `bytes_count`.
pub const DEFAULT_FETCH_SECS: u64 = 5;

/// A fetch that has been accepted but not answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingRequest {
    pub event_id: String,
    pub start_byte: u64,
    pub end_byte: u64,
}

/// Serves `STT_FETCH_MICROPHONE` requests for one entity.
pub struct RecordingCoordinator {
    entity_id: String,
    ring: SharedRingBuffer,
    format: AudioFormat,
    sender: Arc<dyn EventSender>,
    in_flight: Mutex<HashMap<String, RecordingRequest>>,
    cancel: Mutex<CancellationToken>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RecordingCoordinator {
    pub fn new(
        entity_id: impl Into<String>,
        ring: SharedRingBuffer,
        format: AudioFormat,
        sender: Arc<dyn EventSender>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            ring,
            format,
            sender,
            in_flight: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    #[must_use]
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Requests currently waiting for audio or for their result to be sent.
    #[must_use]
    pub fn in_flight(&self) -> Vec<RecordingRequest> {
        lock(&self.in_flight).values().cloned().collect()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Fill in the defaults for a request payload: offset zero and five
    /// seconds of audio.
    #[must_use]
    pub fn resolve(&self, request: FetchMicrophoneRequest) -> (u64, u64) {
        let start = request.start_byte.unwrap_or(0);
        let count = request
            .bytes_count
            .unwrap_or(self.format.bytes_per_second() * DEFAULT_FETCH_SECS);
        (start, count)
    }

    /// Wait until `[start_byte, start_byte + bytes_count)` has been captured
    /// and return it.
    ///
    /// Each wait lasts as long as the missing bytes take to arrive at the
    /// capture rate. A start that was already evicted is clamped to the
    /// earliest live byte.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Channel`] if outstanding fetches were
    /// abandoned while this one waited.
    pub async fn fetch(&self, start_byte: u64, bytes_count: u64) -> Result<RangeRead> {
        let end_byte = start_byte.saturating_add(bytes_count);
        let bytes_per_second = self.format.bytes_per_second().max(1);
        let cancel = lock(&self.cancel).clone();

        loop {
            let shortfall = lock_ring(&self.ring).shortfall(end_byte);
            if shortfall == 0 {
                break;
            }
            let nanos =
                (u128::from(shortfall) * 1_000_000_000).div_ceil(u128::from(bytes_per_second));
            let wait = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
            debug!(
                entity = %self.entity_id,
                shortfall,
                wait_ms = wait.as_millis() as u64,
                "waiting for microphone audio"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(HarmonyError::Channel("fetch abandoned".into()));
                }
                () = tokio::time::sleep(wait) => {}
            }
        }

        let read = lock_ring(&self.ring).read_range(start_byte, end_byte);
        if read.clamped {
            warn!(
                entity = %self.entity_id,
                requested = start_byte,
                served = read.start,
                "fetch start already evicted, serving from earliest live byte"
            );
        }
        Ok(read)
    }

    /// Record a request as in flight and return its resolved
    /// `(start_byte, bytes_count)`.
    pub fn accept(&self, event_id: &str, request: FetchMicrophoneRequest) -> (u64, u64) {
        let (start_byte, bytes_count) = self.resolve(request);
        lock(&self.in_flight).insert(
            event_id.to_owned(),
            RecordingRequest {
                event_id: event_id.to_owned(),
                start_byte,
                end_byte: start_byte.saturating_add(bytes_count),
            },
        );
        (start_byte, bytes_count)
    }

    /// Fetch an accepted request's audio and answer it with an
    /// `STT_FETCH_MICROPHONE_RESULT` event carrying the same event id.
    ///
    /// The request leaves the in-flight set once this returns, whether or
    /// not the result was sent.
    ///
    /// # Errors
    ///
    /// Returns the fetch or send error.
    pub async fn serve(&self, event_id: &str, start_byte: u64, bytes_count: u64) -> Result<()> {
        let result = self.fetch_and_send(event_id, start_byte, bytes_count).await;
        lock(&self.in_flight).remove(event_id);
        result
    }

    /// Answer a request that cannot be served with an `ERROR` result under
    /// the same event id. Nothing is added to the in-flight set.
    ///
    /// # Errors
    ///
    /// Returns the send error.
    pub async fn reject(&self, event_id: &str) -> Result<()> {
        let payload = FetchMicrophoneResult {
            audio_bytes: String::new(),
            channels: self.format.channels,
            bit_depth: self.format.depth.bits(),
            sample_rate: self.format.sample_rate,
        };
        self.sender
            .send_event(Event::new(
                event_id,
                EventType::SttFetchMicrophoneResult,
                EventStatus::Error,
                serde_json::to_value(payload)?,
            ))
            .await
    }

    /// [`accept`](Self::accept) followed by [`serve`](Self::serve).
    ///
    /// # Errors
    ///
    /// Returns the fetch or send error.
    pub async fn process_request(
        &self,
        event_id: &str,
        request: FetchMicrophoneRequest,
    ) -> Result<()> {
        let (start_byte, bytes_count) = self.accept(event_id, request);
        self.serve(event_id, start_byte, bytes_count).await
    }

    async fn fetch_and_send(
        &self,
        event_id: &str,
        start_byte: u64,
        bytes_count: u64,
    ) -> Result<()> {
        let read = self.fetch(start_byte, bytes_count).await?;
        debug!(
            entity = %self.entity_id,
            event_id,
            start = read.start,
            len = read.bytes.len(),
            "sending microphone audio"
        );
        let payload = FetchMicrophoneResult {
            audio_bytes: base64::engine::general_purpose::STANDARD.encode(&read.bytes),
            channels: self.format.channels,
            bit_depth: self.format.depth.bits(),
            sample_rate: self.format.sample_rate,
        };
        self.sender
            .send_event(Event::new(
                event_id,
                EventType::SttFetchMicrophoneResult,
                EventStatus::New,
                serde_json::to_value(payload)?,
            ))
            .await
    }

    /// Wait for in-flight requests to finish, polling every `poll`.
    ///
    /// Gives up after `timeout`, abandons whatever is still waiting, and
    /// returns `false`.
    pub async fn wait_for_drain(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending = self.in_flight_count();
            if pending == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    entity = %self.entity_id,
                    pending,
                    "timed out waiting for microphone fetches, stopping anyway"
                );
                self.abandon();
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Fail every fetch that is still waiting for audio.
    pub fn abandon(&self) {
        let mut cancel = lock(&self.cancel);
        cancel.cancel();
        *cancel = CancellationToken::new();
    }

    /// Forget captured audio; offsets restart at zero.
    pub fn reset(&self) {
        lock_ring(&self.ring).reset();
        info!(entity = %self.entity_id, "capture buffer reset");
    }
}
