//! Configuration types for the Harmony Link adapter.

use crate::audio::{AudioFormat, SampleDepth};
use crate::error::{HarmonyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonyConfig {
    /// Event backend connection settings.
    pub connector: ConnectorConfig,
    /// Which entities this session drives.
    pub scene: SceneConfig,
    /// Session lifecycle settings.
    pub harmony: SessionConfig,
    /// Microphone capture / speech-to-text settings.
    pub stt: SttConfig,
    /// Speaker output / text-to-speech settings.
    pub tts: TtsConfig,
}

/// Event backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// WebSocket endpoint of the Harmony Link event backend.
    pub ws_endpoint: String,
    /// Log a warning when this many sends are queued and unresolved.
    pub send_queue_warn_depth: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: "ws://localhost:28080".to_owned(),
            send_queue_warn_depth: 256,
        }
    }
}

/// Entity roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Entity representing the human user (owns the microphone).
    pub user_entity_id: String,
    /// AI-driven character entities.
    pub character_entity_ids: Vec<String>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            user_entity_id: "user".to_owned(),
            character_entity_ids: vec!["character".to_owned()],
        }
    }
}

impl SceneConfig {
    /// All entity ids, user first, trimmed, in configuration order.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<String> {
        std::iter::once(self.user_entity_id.trim().to_owned())
            .chain(
                self.character_entity_ids
                    .iter()
                    .map(|id| id.trim().to_owned()),
            )
            .collect()
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to wait after starting the connectors before sending init events.
    pub start_warmup_secs: u64,
    /// Give up on the init handshake after this many seconds.
    pub init_timeout_secs: u64,
    /// Tear the whole session down when any entity's connector fails.
    pub shutdown_on_entity_failure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_warmup_secs: 1,
            init_timeout_secs: 30,
            shutdown_on_entity_failure: true,
        }
    }
}

/// Microphone capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Input device name (substring match) or `"default"`.
    pub microphone: String,
    /// Number of capture channels.
    pub channels: u16,
    /// Bits per sample: 8, 16, 24 or 32.
    pub bit_depth: u16,
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Seconds of audio retained by the ring buffer.
    pub buffer_clip_duration_secs: u32,
    /// Capture callback block size in milliseconds.
    pub record_stepping_ms: u32,
    /// Let the backend detect speech boundaries itself.
    pub auto_vad: bool,
    /// Start listening on the user entity as soon as the session is ready.
    pub listen_on_start: bool,
    /// Maximum time to wait for in-flight fetches when recording stops.
    pub drain_timeout_ms: u64,
    /// Poll interval while draining in-flight fetches.
    pub drain_poll_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            microphone: "default".to_owned(),
            channels: 1,
            bit_depth: 16,
            sample_rate: 16_000,
            buffer_clip_duration_secs: 60,
            record_stepping_ms: 100,
            auto_vad: true,
            listen_on_start: true,
            drain_timeout_ms: 10_000,
            drain_poll_ms: 100,
        }
    }
}

impl SttConfig {
    /// Capture format derived from this config.
    ///
    /// # Errors
    ///
    /// Returns an error if the bit depth is not supported.
    pub fn audio_format(&self) -> Result<AudioFormat> {
        let depth = SampleDepth::from_bits(self.bit_depth).ok_or_else(|| {
            HarmonyError::Config(format!("unsupported bit depth: {}", self.bit_depth))
        })?;
        Ok(AudioFormat::new(self.sample_rate, self.channels, depth))
    }

    /// Ring buffer capacity in bytes.
    pub fn ring_capacity_bytes(&self) -> Result<usize> {
        let format = self.audio_format()?;
        Ok(format.bytes_per_second() as usize * self.buffer_clip_duration_secs as usize)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    #[must_use]
    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms.max(1))
    }
}

/// Speaker output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Output device name (substring match) or `"default"`.
    pub speaker: String,
    /// Interval between lipsync samples in milliseconds.
    pub lipsync_interval_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            speaker: "default".to_owned(),
            lipsync_interval_ms: 100,
        }
    }
}

impl TtsConfig {
    #[must_use]
    pub fn lipsync_interval(&self) -> Duration {
        Duration::from_millis(self.lipsync_interval_ms.max(1))
    }
}

impl HarmonyConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| HarmonyError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| HarmonyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/harmony-vts/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("harmony-vts")
            .join("config.toml")
    }

    /// Check the values the session cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.connector.ws_endpoint.trim().is_empty() {
            return Err(HarmonyError::Config("connector.ws_endpoint is empty".into()));
        }
        if self.scene.user_entity_id.trim().is_empty() {
            return Err(HarmonyError::Config("scene.user_entity_id is empty".into()));
        }
        if self.scene.character_entity_ids.is_empty()
            || self
                .scene
                .character_entity_ids
                .iter()
                .any(|id| id.trim().is_empty())
        {
            return Err(HarmonyError::Config(
                "scene.character_entity_ids must list at least one non-empty id".into(),
            ));
        }
        let ids = self.scene.entity_ids();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != ids.len() {
            return Err(HarmonyError::Config("scene entity ids must be unique".into()));
        }
        if self.stt.channels == 0 || self.stt.sample_rate == 0 {
            return Err(HarmonyError::Config(
                "stt.channels and stt.sample_rate must be non-zero".into(),
            ));
        }
        if self.stt.buffer_clip_duration_secs == 0 {
            return Err(HarmonyError::Config(
                "stt.buffer_clip_duration_secs must be non-zero".into(),
            ));
        }
        self.stt.audio_format()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HarmonyConfig::default();
        config.validate().expect("default config validates");
        assert_eq!(config.stt.sample_rate, 16_000);
        assert_eq!(config.stt.bit_depth, 16);
        assert_eq!(config.tts.lipsync_interval(), Duration::from_millis(100));
        assert_eq!(config.stt.drain_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = HarmonyConfig::default();
        config.scene.character_entity_ids = vec!["aria".into(), "kai".into()];
        config.stt.bit_depth = 24;
        config.save_to_file(&path).expect("save config");

        let loaded = HarmonyConfig::from_file(&path).expect("load config");
        assert_eq!(loaded.scene.character_entity_ids, vec!["aria", "kai"]);
        assert_eq!(loaded.stt.bit_depth, 24);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = HarmonyConfig::from_file(Path::new("/nonexistent/harmony.toml"));
        assert!(matches!(result, Err(HarmonyError::Io(_))));
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is [not valid toml").expect("write file");
        let result = HarmonyConfig::from_file(&path);
        assert!(matches!(result, Err(HarmonyError::Config(_))));
    }

    #[test]
    fn partial_file_uses_defaults() {
        let toml_src = r#"
            [scene]
            user_entity_id = "me"
            character_entity_ids = ["a", "b"]

            [stt]
            sample_rate = 48000
        "#;
        let config: HarmonyConfig = toml::from_str(toml_src).expect("parse partial config");
        assert_eq!(config.scene.entity_ids(), vec!["me", "a", "b"]);
        assert_eq!(config.stt.sample_rate, 48_000);
        assert_eq!(config.stt.channels, 1);
        assert_eq!(config.connector.ws_endpoint, "ws://localhost:28080");
    }

    #[test]
    fn ring_capacity_matches_clip_duration() {
        let stt = SttConfig {
            sample_rate: 16_000,
            bit_depth: 8,
            channels: 1,
            buffer_clip_duration_secs: 2,
            ..SttConfig::default()
        };
        assert_eq!(stt.ring_capacity_bytes().expect("capacity"), 32_000);
    }

    #[test]
    fn validate_rejects_unsupported_bit_depth() {
        let mut config = HarmonyConfig::default();
        config.stt.bit_depth = 12;
        assert!(matches!(config.validate(), Err(HarmonyError::Config(_))));
    }

    #[test]
    fn validate_rejects_duplicate_entities() {
        let mut config = HarmonyConfig::default();
        config.scene.character_entity_ids = vec!["user".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = HarmonyConfig::default_config_path();
        assert!(path.ends_with("harmony-vts/config.toml"));
    }
}
