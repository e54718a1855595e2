//! Registry error types.

use thiserror::Error;

use crate::record::CallPhase;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no call record for key {0}")]
    CallNotFound(String),

    #[error("call record already exists for key {0}")]
    CallExists(String),

    #[error("invalid phase transition {from:?} -> {to:?} for call {call_key}")]
    InvalidTransition {
        call_key: String,
        from: CallPhase,
        to: CallPhase,
    },

    /// A call record holds at most one port at a time.
    #[error("call {call_key} already holds port {held}, refused port {requested}")]
    PortConflict {
        call_key: String,
        held: u16,
        requested: u16,
    },

    #[error("call {call_key} is in phase {phase:?}, not deletable")]
    NotDeletable { call_key: String, phase: CallPhase },
}

pub type Result<T> = std::result::Result<T, Error>;
