//! Engine configuration.
//!
//! Serde-friendly: durations are plain millisecond integers so the whole
//! struct loads from a JSON file or environment layer without custom
//! deserializers. Conversion into the per-unit config structs happens once,
//! at call setup.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voicebridge_ai_session::{SessionConfig, TurnDetectionConfig};
use voicebridge_rtp_relay::{DrainPolicy, ReceiverConfig, SenderConfig};

/// Connection settings for the speech-model service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub url: String,
    /// Bearer token. Usually injected from the environment, not the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_model: Option<String>,
    pub turn_detection: TurnDetectionConfig,
    pub idle_timeout_ms: u64,
    pub append_min_interval_ms: u64,
    pub max_recovery_attempts: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let base = SessionConfig::default();
        Self {
            url: base.url,
            api_key: None,
            voice: base.voice,
            instructions: None,
            transcription_model: base.transcription_model,
            turn_detection: TurnDetectionConfig::default(),
            idle_timeout_ms: base.idle_timeout.as_millis() as u64,
            append_min_interval_ms: base.append_min_interval.as_millis() as u64,
            max_recovery_attempts: base.max_recovery_attempts,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local address RTP sockets bind on.
    pub bind_ip: IpAddr,
    /// First port of the contiguous RTP pool.
    pub first_rtp_port: u16,
    /// Number of ports in the pool; one concurrent call per port.
    pub rtp_port_count: u16,

    /// Receiver batch-flush byte threshold.
    pub flush_min_bytes: usize,
    /// Receiver batch-flush interval.
    pub flush_interval_ms: u64,

    /// Outbound frame size in bytes (one frame per pacing tick).
    pub frame_bytes: usize,
    pub frame_duration_ms: u64,
    /// Adaptive output buffer bounds, in frames.
    pub min_depth: usize,
    pub max_depth: usize,
    pub steady_cooldown_ms: u64,
    /// Drain queued outbound frames on teardown instead of discarding.
    pub drain_on_teardown: bool,

    /// Enable the energy-gating pre-filter on inbound audio.
    pub energy_gate: bool,

    /// Interval of the background orphaned-port audit sweep.
    pub audit_interval_ms: u64,
    /// A lease must be orphaned at least this long before the sweep acts
    /// on it, so teardown races never look like leaks.
    pub min_orphan_age_ms: u64,
    /// Let the sweep force-release aged orphans instead of only reporting.
    pub audit_auto_release: bool,

    pub model: ModelSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            first_rtp_port: 10000,
            rtp_port_count: 200,
            flush_min_bytes: 1600,
            flush_interval_ms: 200,
            frame_bytes: 160,
            frame_duration_ms: 20,
            min_depth: 2,
            max_depth: 12,
            steady_cooldown_ms: 2000,
            drain_on_teardown: false,
            energy_gate: false,
            audit_interval_ms: 30_000,
            min_orphan_age_ms: 60_000,
            audit_auto_release: false,
            model: ModelSettings::default(),
        }
    }
}

impl EngineConfig {
    pub(crate) fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            flush_min_bytes: self.flush_min_bytes,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            ..ReceiverConfig::default()
        }
    }

    pub(crate) fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            frame_bytes: self.frame_bytes,
            frame_duration: Duration::from_millis(self.frame_duration_ms),
            samples_per_frame: self.frame_bytes as u32,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
            steady_cooldown: Duration::from_millis(self.steady_cooldown_ms),
            drain_policy: if self.drain_on_teardown {
                DrainPolicy::Drain
            } else {
                DrainPolicy::Discard
            },
            ..SenderConfig::default()
        }
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig {
            url: self.model.url.clone(),
            api_key: self.model.api_key.clone(),
            voice: self.model.voice.clone(),
            instructions: self.model.instructions.clone(),
            transcription_model: self.model.transcription_model.clone(),
            turn_detection: self.model.turn_detection.clone(),
            idle_timeout: Duration::from_millis(self.model.idle_timeout_ms),
            append_min_interval: Duration::from_millis(self.model.append_min_interval_ms),
            max_recovery_attempts: self.model.max_recovery_attempts,
            ..SessionConfig::default()
        }
    }

    pub(crate) fn audit_interval(&self) -> Duration {
        Duration::from_millis(self.audit_interval_ms)
    }

    pub(crate) fn min_orphan_age(&self) -> Duration {
        Duration::from_millis(self.min_orphan_age_ms)
    }
}
