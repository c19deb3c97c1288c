//! Configuration types for the talk pipeline.

use crate::error::{Result, TalkError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for Talk Mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Streaming recognizer settings.
    pub recognizer: RecognizerConfig,
    /// Barge-in (interrupt) detection while the assistant is speaking.
    pub barge_in: BargeInConfig,
    /// Reasoning gateway connection settings.
    pub gateway: GatewayConfig,
    /// Streaming synthesis settings.
    pub tts: TtsConfig,
    /// Conversation timing and history settings.
    pub conversation: ConversationConfig,
    /// Model management settings.
    pub models: ModelConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate delivered to the recognizer, in Hz.
    pub input_sample_rate: u32,
    /// Samples per captured frame (after downmix/resample).
    pub frame_size: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            frame_size: 1024,
            input_device: None,
            output_device: None,
        }
    }
}

/// Streaming speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Silence after the last partial result before the transcript is finalized.
    pub silence_timeout_ms: u64,
    /// How often the local engine re-transcribes the growing utterance.
    pub partial_interval_ms: u64,
    /// HuggingFace model ID for the local recognizer.
    pub model_id: String,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 1500,
            partial_interval_ms: 400,
            model_id: "istupakov/parakeet-tdt-0.6b-v3-onnx".to_owned(),
        }
    }
}

impl RecognizerConfig {
    #[must_use]
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

/// Barge-in configuration (user interrupts assistant by speaking).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether barge-in is enabled.
    pub enabled: bool,
    /// RMS level a frame must exceed to count towards detection.
    ///
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.03: sensitive (quiet rooms, headset mic)
    ///   - 0.06: default, ignores most speaker leakage
    ///   - 0.10: only loud, close speech
    pub threshold: f32,
    /// Consecutive frames above threshold required before firing.
    pub required_frames: u32,
    /// Ignore all levels for this long after monitoring starts (ms).
    ///
    /// Covers the ramp-up of the assistant's own playback.
    pub grace_period_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.06,
            required_frames: 4,
            grace_period_ms: 500,
        }
    }
}

/// Reconnection policy for the gateway transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry; doubles per consecutive failure.
    pub base_delay_ms: u64,
    /// Upper bound on any single retry delay.
    pub max_delay_ms: u64,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub cooldown_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

/// Gateway (reasoning backend) connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway.
    pub url: String,
    /// Shared auth token sent in the connect handshake.
    pub token: Option<String>,
    /// Conversation session the chat requests are routed to.
    pub session_key: String,
    /// Client identifier announced in the handshake.
    pub client_id: String,
    /// Client version announced in the handshake.
    pub client_version: String,
    /// Role requested in the handshake.
    pub role: String,
    /// Scopes requested in the handshake.
    pub scopes: Vec<String>,
    /// Protocol version spoken by this client.
    pub protocol_version: u32,
    /// Connect → snapshot must complete within this window.
    pub handshake_timeout_ms: u64,
    /// Upper bound on waiting for any request acknowledgement.
    pub request_timeout_ms: u64,
    /// Heartbeat interval once connected.
    pub heartbeat_interval_secs: u64,
    /// Reconnection/backoff policy.
    pub reconnect: ReconnectConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_owned(),
            token: None,
            session_key: "main".to_owned(),
            client_id: "clawk-talk".to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            role: "operator".to_owned(),
            scopes: vec!["operator.read".to_owned(), "operator.write".to_owned()],
            protocol_version: 3,
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
            heartbeat_interval_secs: 25,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Streaming synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// WebSocket URL of the local synthesis server.
    pub server_url: String,
    /// Voice name forwarded to the server (None = server default).
    pub voice: Option<String>,
    /// Playback buffers allowed in flight at once.
    pub playback_buffers: usize,
    /// Decoded audio is coalesced into buffers of at least this length.
    pub min_buffer_ms: u32,
    /// Longest sentence the server accepts, in characters.
    pub max_text_len: usize,
    /// Maximum wait for the next frame of a streamed sentence.
    pub frame_timeout_ms: u64,
    /// Offline synthesizer command override (program followed by arguments).
    ///
    /// `{output}` in an argument is replaced with the path of the WAV file
    /// to write. The sentence is written to the command's stdin.
    pub offline_command: Option<Vec<String>>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8765".to_owned(),
            voice: None,
            playback_buffers: 3,
            min_buffer_ms: 120,
            max_text_len: 5_000,
            frame_timeout_ms: 10_000,
            offline_command: None,
        }
    }
}

/// Conversation timing and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Maximum time in `thinking` without any backend activity.
    pub thinking_timeout_secs: u64,
    /// Maximum time in `speaking` without any buffer finishing playback.
    pub playback_stall_timeout_secs: u64,
    /// Conversation turns retained in history (oldest trimmed first).
    pub history_limit: usize,
    /// Where the history document is stored.
    pub history_path: PathBuf,
    /// Return to listening after a response finishes playing.
    pub auto_listen: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            thinking_timeout_secs: 30,
            playback_stall_timeout_secs: 20,
            history_limit: 50,
            history_path: default_data_dir().join("talk-history.json"),
            auto_listen: false,
        }
    }
}

/// Model management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory for caching downloaded models.
    pub cache_dir: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("clawk"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("clawk")
}

/// Directory for rotated log files.
#[must_use]
pub fn default_log_dir() -> PathBuf {
    default_data_dir().join("logs")
}

impl TalkConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| TalkError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TalkError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/clawk/talk.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("clawk").join("talk.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("clawk")
                .join("talk.toml")
        } else {
            PathBuf::from("/tmp/clawk-config/talk.toml")
        }
    }

    /// Check values that would otherwise fail deep inside a running pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`TalkError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        validate_ws_url("gateway.url", &self.gateway.url)?;
        validate_ws_url("tts.server_url", &self.tts.server_url)?;
        if self.audio.frame_size == 0 {
            return Err(TalkError::Config("audio.frame_size must be > 0".into()));
        }
        if !(1..=16).contains(&self.tts.playback_buffers) {
            return Err(TalkError::Config(
                "tts.playback_buffers must be between 1 and 16".into(),
            ));
        }
        if self.barge_in.required_frames == 0 {
            return Err(TalkError::Config(
                "barge_in.required_frames must be > 0".into(),
            ));
        }
        if self.gateway.reconnect.failure_threshold == 0 {
            return Err(TalkError::Config(
                "gateway.reconnect.failure_threshold must be > 0".into(),
            ));
        }
        if self.conversation.history_limit == 0 {
            return Err(TalkError::Config(
                "conversation.history_limit must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn validate_ws_url(field: &str, raw: &str) -> Result<()> {
    let parsed =
        url::Url::parse(raw).map_err(|e| TalkError::Config(format!("{field}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(TalkError::Config(format!(
            "{field}: unsupported scheme '{other}', expected ws or wss"
        ))),
    }
}
