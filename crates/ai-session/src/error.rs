//! Session error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("unexpected message from model: {0}")]
    Protocol(String),

    /// No model activity within the idle window. Triggers recovery, not
    /// call termination.
    #[error("session stalled: no model activity for {idle_secs}s")]
    Stall { idle_secs: u64 },

    /// Recovery failed repeatedly; the call must be failed.
    #[error("session unrecoverable after {attempts} recovery attempts")]
    Unrecoverable { attempts: u32 },

    #[error("session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
