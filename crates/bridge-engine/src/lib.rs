//! Per-call orchestration between a telephony switch and a realtime
//! speech model.
//!
//! The engine consumes switch control-plane events, owns the call
//! registry and the RTP port pool, spawns the per-call media receiver,
//! media sender, and model session, and exposes a diagnostic surface for
//! operators. It issues switch commands through a channel; the control
//! layer that talks to the switch lives outside this crate.

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod logging;
pub mod switch;

pub use config::{EngineConfig, ModelSettings};
pub use diagnostics::{CallStatus, OrphanReport, OrphanedLease};
pub use engine::{BridgeEngine, LogTranscriptSink, TranscriptSink};
pub use error::{Error, Result};
pub use logging::{parse_log_level, setup_logging, LoggingConfig};
pub use switch::{SwitchCommand, SwitchEvent};

pub use voicebridge_ai_session::SessionState;
pub use voicebridge_call_registry::{CallKey, CallPhase};
