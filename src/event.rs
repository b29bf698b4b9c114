//! Event envelopes exchanged with the Harmony Link backend.
//!
//! Every message on the wire, in both directions, is a JSON object of the form
//! `{"event_id": "...", "event_type": "...", "status": "...", "payload": ...}`.
//! Events are immutable values: a handler that reacts to one builds a new
//! [`Event`] instead of editing the one it received.

use serde::{Deserialize, Serialize};

/// Routing key for an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    InitEntity,
    EnvironmentLoaded,
    SttStartListen,
    SttStopListen,
    SttFetchMicrophone,
    SttFetchMicrophoneResult,
    SttOutputText,
    SttSpeechStarted,
    SttSpeechStopped,
    AiSpeech,
    AiAction,
    AiStatus,
    TtsPlaybackDone,
    PerceptionActorUtterance,
    UserUtterance,
    /// Any type this adapter does not route; preserved verbatim.
    Other(String),
}

impl EventType {
    /// Render the event type to wire format.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::InitEntity => "INIT_ENTITY",
            Self::EnvironmentLoaded => "ENVIRONMENT_LOADED",
            Self::SttStartListen => "STT_START_LISTEN",
            Self::SttStopListen => "STT_STOP_LISTEN",
            Self::SttFetchMicrophone => "STT_FETCH_MICROPHONE",
            Self::SttFetchMicrophoneResult => "STT_FETCH_MICROPHONE_RESULT",
            Self::SttOutputText => "STT_OUTPUT_TEXT",
            Self::SttSpeechStarted => "STT_SPEECH_STARTED",
            Self::SttSpeechStopped => "STT_SPEECH_STOPPED",
            Self::AiSpeech => "AI_SPEECH",
            Self::AiAction => "AI_ACTION",
            Self::AiStatus => "AI_STATUS",
            Self::TtsPlaybackDone => "TTS_PLAYBACK_DONE",
            Self::PerceptionActorUtterance => "PERCEPTION_ACTOR_UTTERANCE",
            Self::UserUtterance => "USER_UTTERANCE",
            Self::Other(raw) => raw,
        }
    }

    /// Parse an event type from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "INIT_ENTITY" => Self::InitEntity,
            "ENVIRONMENT_LOADED" => Self::EnvironmentLoaded,
            "STT_START_LISTEN" => Self::SttStartListen,
            "STT_STOP_LISTEN" => Self::SttStopListen,
            "STT_FETCH_MICROPHONE" => Self::SttFetchMicrophone,
            "STT_FETCH_MICROPHONE_RESULT" => Self::SttFetchMicrophoneResult,
            "STT_OUTPUT_TEXT" => Self::SttOutputText,
            "STT_SPEECH_STARTED" => Self::SttSpeechStarted,
            "STT_SPEECH_STOPPED" => Self::SttSpeechStopped,
            "AI_SPEECH" => Self::AiSpeech,
            "AI_ACTION" => Self::AiAction,
            "AI_STATUS" => Self::AiStatus,
            "TTS_PLAYBACK_DONE" => Self::TtsPlaybackDone,
            "PERCEPTION_ACTOR_UTTERANCE" => Self::PerceptionActorUtterance,
            "USER_UTTERANCE" => Self::UserUtterance,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Speech-ready events that carry a synthesized audio reference.
    #[must_use]
    pub fn is_speech(&self) -> bool {
        matches!(self, Self::AiSpeech | Self::AiAction)
    }
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_owned()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle marker: request, in progress, result, or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    New,
    Processing,
    Done,
    Error,
}

/// One unit of cross-boundary communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub status: EventStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event_type: EventType,
        status: EventStatus,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type,
            status,
            payload,
        }
    }

    /// True when this event has the given type and `DONE` status.
    #[must_use]
    pub fn is_done(&self, event_type: &EventType) -> bool {
        self.status == EventStatus::Done && &self.event_type == event_type
    }

    /// Parse a wire message.
    ///
    /// # Errors
    ///
    /// Returns [`crate::HarmonyError::Protocol`] for empty or malformed input.
    pub fn from_wire(text: &str) -> crate::Result<Self> {
        if text.trim().is_empty() {
            return Err(crate::HarmonyError::Protocol("empty message".into()));
        }
        serde_json::from_str(text)
            .map_err(|e| crate::HarmonyError::Protocol(format!("malformed event: {e}")))
    }

    /// Encode this event as a wire message.
    pub fn to_wire(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            crate::HarmonyError::Protocol(format!(
                "invalid {} payload for event {}: {e}",
                self.event_type, self.event_id
            ))
        })
    }
}

/// Payload of `STT_FETCH_MICROPHONE`. Missing fields are filled in by the
/// receiver, since the default count depends on the capture format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMicrophoneRequest {
    #[serde(default)]
    pub start_byte: Option<u64>,
    #[serde(default)]
    pub bytes_count: Option<u64>,
}

/// Payload of `STT_FETCH_MICROPHONE_RESULT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMicrophoneResult {
    /// Base64-encoded raw PCM bytes.
    pub audio_bytes: String,
    pub channels: u16,
    pub bit_depth: u16,
    pub sample_rate: u32,
}

/// How the backend treats audio collected while listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultMode {
    Process,
    Return,
}

/// Payload of `STT_START_LISTEN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartListenPayload {
    pub auto_vad: bool,
    pub result_mode: ResultMode,
    pub channels: u16,
    pub bit_depth: u16,
    pub sample_rate: u32,
}

impl StartListenPayload {
    /// Auto VAD returns results to the sender; manual mode lets the backend process them.
    #[must_use]
    pub fn new(auto_vad: bool, channels: u16, bit_depth: u16, sample_rate: u32) -> Self {
        Self {
            auto_vad,
            result_mode: if auto_vad {
                ResultMode::Return
            } else {
                ResultMode::Process
            },
            channels,
            bit_depth,
            sample_rate,
        }
    }
}

/// Payload of `STT_OUTPUT_TEXT` and `PERCEPTION_ACTOR_UTTERANCE`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtterancePayload {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Backend-specific fields passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Payload of `AI_SPEECH` / `AI_ACTION`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechPayload {
    #[serde(default)]
    pub audio_file: String,
}
