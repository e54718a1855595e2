//! Control-plane messages exchanged with the telephony switch.
//!
//! The engine does not speak to the switch itself; an external control
//! layer translates switch signaling into [`SwitchEvent`]s and executes
//! the [`SwitchCommand`]s the engine emits.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Inbound notifications from the switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwitchEvent {
    /// A call's channel exists; media setup may begin.
    ChannelCreated {
        call_key: String,
        /// The switch's own identifier for the call leg, kept on the call
        /// record for correlation.
        #[serde(default)]
        carrier_call_id: Option<String>,
    },
    /// The switch has negotiated its media endpoint; outbound frames for
    /// this call go to `media_addr`.
    StreamReady {
        call_key: String,
        media_addr: SocketAddr,
    },
    /// The call leg is gone. Always sent, including after failures, so it
    /// doubles as the hangup signal.
    ChannelDestroyed { call_key: String },
}

impl SwitchEvent {
    pub fn call_key(&self) -> &str {
        match self {
            SwitchEvent::ChannelCreated { call_key, .. }
            | SwitchEvent::StreamReady { call_key, .. }
            | SwitchEvent::ChannelDestroyed { call_key } => call_key,
        }
    }
}

/// Outbound instructions to the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SwitchCommand {
    /// Answer the call leg.
    Answer { call_key: String },
    /// Point the switch's media stream at the call's leased RTP port.
    StartExternalMedia {
        call_key: String,
        local_addr: SocketAddr,
        payload_type: u8,
    },
    /// Tear the call leg down.
    Hangup { call_key: String },
}
