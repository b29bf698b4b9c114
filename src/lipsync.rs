//! Mouth actuation and the lipsync heuristic.
//!
//! Mouth openness is not derived from the waveform. While speech plays, a
//! random openness is drawn on every tick; anything above
//! [`FULL_OPEN_THRESHOLD`] snaps to fully open, which reads as natural
//! talking on a 2D avatar.

use rand::Rng;
use std::sync::{Arc, Mutex};

/// Samples above this value are sent as fully open.
pub const FULL_OPEN_THRESHOLD: f32 = 0.7;

/// External sink for mouth openness (VTube Studio parameter, game actor, ...).
///
/// Calls are fire-and-forget; implementations that talk to a remote peer
/// should queue internally rather than block the caller.
pub trait MouthActuator: Send + Sync {
    /// Set mouth openness in `[0, 1]`.
    fn set_mouth_open(&self, value: f32);
}

/// Draw one lipsync sample.
pub fn lipsync_sample<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let value: f32 = rng.gen_range(0.0..1.0);
    if value > FULL_OPEN_THRESHOLD { 1.0 } else { value }
}

/// Actuator that only logs, for running without an avatar attached.
#[derive(Debug, Clone)]
pub struct TracingMouthActuator {
    entity_id: String,
}

impl TracingMouthActuator {
    #[must_use]
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
        }
    }
}

impl MouthActuator for TracingMouthActuator {
    fn set_mouth_open(&self, value: f32) {
        tracing::trace!(entity = %self.entity_id, mouth_open = value, "lipsync");
    }
}

/// Actuator that records every value it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingMouthActuator {
    values: Arc<Mutex<Vec<f32>>>,
}

impl RecordingMouthActuator {
    /// Values received so far, oldest first.
    #[must_use]
    pub fn values(&self) -> Vec<f32> {
        match self.values.lock() {
            Ok(v) => v.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    /// Most recent value, if any.
    #[must_use]
    pub fn last(&self) -> Option<f32> {
        self.values().last().copied()
    }
}

impl MouthActuator for RecordingMouthActuator {
    fn set_mouth_open(&self, value: f32) {
        match self.values.lock() {
            Ok(mut v) => v.push(value),
            Err(p) => p.into_inner().push(value),
        }
    }
}
