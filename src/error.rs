//! Error types for the Harmony Link adapter.

/// Top-level error type for the event bus and audio pipeline.
#[derive(Debug, thiserror::Error)]
pub enum HarmonyError {
    /// Audio device or stream error (microphone / speaker).
    #[error("audio error: {0}")]
    Audio(String),

    /// Connection-level failure on the event backend socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A single outbound event could not be written.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Internal channel closed or completion handle dropped.
    #[error("channel error: {0}")]
    Channel(String),

    /// Entity startup / lifecycle error.
    #[error("entity error: {0}")]
    Entity(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, HarmonyError>;
