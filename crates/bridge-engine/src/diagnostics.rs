//! Snapshot types for the diagnostic surface.

use serde::Serialize;
use voicebridge_ai_session::{SessionCountersSnapshot, SessionState};
use voicebridge_call_registry::CallPhase;
use voicebridge_rtp_relay::{ReceiverStatsSnapshot, SenderStatsSnapshot};

/// Full status of one call: registry record plus live counters from each
/// running unit. Units that have not started yet (or are already gone)
/// report `None`.
#[derive(Debug, Clone, Serialize)]
pub struct CallStatus {
    pub call_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier_call_id: Option<String>,
    pub phase: CallPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtp_port: Option<u16>,
    pub inbound_ready: bool,
    pub outbound_ready: bool,
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<ReceiverStatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderStatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionCountersSnapshot>,
}

/// One port lease whose call record is absent or terminal.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanedLease {
    pub port: u16,
    pub call_key: String,
    pub held_ms: u64,
    /// True when the lease is old enough for the sweep to act on.
    pub actionable: bool,
}

/// Result of an orphaned-port audit or cleanup pass.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanReport {
    pub orphans: Vec<OrphanedLease>,
    /// Ports actually returned to the pool by this pass.
    pub released: usize,
}

impl OrphanReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}
