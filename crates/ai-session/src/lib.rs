//! Per-call session to the cloud speech-to-speech model.
//!
//! One persistent duplex WebSocket connection per call. Caller audio goes
//! up as base64 append messages; transcript and audio deltas come back and
//! are relayed to the media sender and transcript consumer. A stall
//! detector degrades and recovers the session without touching the call
//! record.

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;

pub use config::{SessionConfig, TurnDetectionConfig};
pub use error::{Error, Result};
pub use protocol::{ClientEvent, ServerEvent};
pub use session::{
    ModelSession, SessionCounters, SessionCountersSnapshot, SessionEvent, SessionState,
};
