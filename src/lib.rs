//! harmony-vts: real-time audio adapter between avatars and Harmony Link.
//!
//! Each entity in a scene (the human user and any number of AI characters)
//! gets its own event connection to the Harmony Link backend. On top of
//! that connection the crate runs:
//! - **STT**: microphone capture into a ring buffer, served to the backend
//!   on request as byte ranges
//! - **TTS**: playback of synthesized WAV files with a randomized lipsync
//!   signal, acknowledged back to the backend when done
//! - **Perception**: relaying one entity's utterances and speech boundaries
//!   to its siblings
//!
//! [`session::HarmonySession`] wires entities together and runs the
//! startup handshake.

pub mod audio;
pub mod config;
pub mod connector;
pub mod entity;
pub mod error;
pub mod event;
pub mod lipsync;
pub mod perception;
pub mod session;
pub mod stt;
#[doc(hidden)]
pub mod test_utils;
pub mod tts;

pub use config::HarmonyConfig;
pub use connector::{Connector, EventHandler, EventSender};
pub use error::{HarmonyError, Result};
pub use event::{Event, EventStatus, EventType};
pub use session::{EntityFactory, HarmonySession, RunningSession};
