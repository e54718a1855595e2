//! Call record and lifecycle phase types.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

/// Switch-side channel identifier used to index the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallKey(String);

impl CallKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CallKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle phase of a bridged call.
///
/// `Failed` is a side-state reachable from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallPhase {
    /// Record created from the call-setup signal.
    Initiated,
    /// Switch acknowledged channel creation; media transports pending.
    AwaitingMedia,
    /// Both inbound and outbound transports confirmed usable.
    MediaActive,
    /// Hangup or error signal received; resources being torn down.
    Terminating,
    /// Port released and AI session closed; record deletable.
    Closed,
    /// Unrecoverable failure; resources released, upstream notified.
    Failed,
}

impl CallPhase {
    /// Terminal phases make a record deletable and a lease orphanable.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::Closed | CallPhase::Failed)
    }

    /// Legal phase edges. `Terminating` is reachable from any live phase
    /// (hangup can arrive at any time) and `Failed` from anywhere.
    pub(crate) fn can_transition_to(self, to: CallPhase) -> bool {
        use CallPhase::*;
        match (self, to) {
            (_, Failed) => true,
            (Initiated, AwaitingMedia) => true,
            (AwaitingMedia, MediaActive) => true,
            (Initiated | AwaitingMedia | MediaActive, Terminating) => true,
            (Terminating, Closed) => true,
            // Duplicate teardown signals land here; the registry treats
            // them as no-ops rather than errors.
            (Terminating, Terminating) => true,
            _ => false,
        }
    }
}

/// Opaque references to switch-owned resources, held only as identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchHandles {
    pub primary_channel: Option<String>,
    pub snoop_channel: Option<String>,
    pub playback_channel: Option<String>,
    pub inbound_media_channel: Option<String>,
    pub outbound_media_channel: Option<String>,
}

/// One active call's state. Cloned snapshots are handed to readers; the
/// authoritative copy lives inside the registry.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_key: CallKey,
    pub carrier_call_id: Option<String>,
    pub phase: CallPhase,
    /// The leased RTP port. Invariant: at most one port per record, and a
    /// port is never held by two records; the allocator enforces the
    /// latter, [`crate::CallRegistry::set_port`] the former.
    pub rtp_port: Option<u16>,
    /// Set by the media receiver once its transport is usable.
    pub inbound_ready: bool,
    /// Set by the media sender once its transport is usable.
    pub outbound_ready: bool,
    pub handles: SwitchHandles,
    pub created_at: Instant,
}

impl CallRecord {
    pub fn new(call_key: CallKey, carrier_call_id: Option<String>) -> Self {
        Self {
            call_key,
            carrier_call_id,
            phase: CallPhase::Initiated,
            rtp_port: None,
            inbound_ready: false,
            outbound_ready: false,
            handles: SwitchHandles::default(),
            created_at: Instant::now(),
        }
    }
}
