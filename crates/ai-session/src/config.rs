//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Turn-detection parameters sent to the model on session configure.
/// Tunable per deployment, fixed for the session's duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    /// Speech start/stop sensitivity, 0.0..=1.0.
    pub threshold: f32,
    /// Leading audio included before detected speech start.
    pub prefix_padding_ms: u32,
    /// Trailing silence before an utterance counts as finished.
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 600,
        }
    }
}

/// Per-call session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint, including the model selector.
    pub url: String,
    /// Bearer token for the model service; absent for local test servers.
    pub api_key: Option<String>,
    /// Voice used for model speech output.
    pub voice: String,
    /// System instructions injected at configure time.
    pub instructions: Option<String>,
    /// Audio format for caller audio (`g711_ulaw` on the telephony path).
    pub input_audio_format: String,
    /// Audio format for model audio.
    pub output_audio_format: String,
    /// Transcription model; `None` disables input transcription.
    pub transcription_model: Option<String>,
    pub turn_detection: TurnDetectionConfig,
    /// No model activity for this long marks the session degraded.
    pub idle_timeout: Duration,
    /// Minimum spacing between append messages; audio arriving faster is
    /// coalesced so the message rate stays bounded.
    pub append_min_interval: Duration,
    /// Consecutive failed reconnects before the session is unrecoverable.
    pub max_recovery_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".to_string(),
            api_key: None,
            voice: "alloy".to_string(),
            instructions: None,
            input_audio_format: "g711_ulaw".to_string(),
            output_audio_format: "g711_ulaw".to_string(),
            transcription_model: Some("whisper-1".to_string()),
            turn_detection: TurnDetectionConfig::default(),
            idle_timeout: Duration::from_secs(30),
            append_min_interval: Duration::from_millis(50),
            max_recovery_attempts: 3,
        }
    }
}
