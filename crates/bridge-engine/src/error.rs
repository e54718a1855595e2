//! Engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("media transport error: {0}")]
    Transport(#[from] voicebridge_rtp_relay::Error),

    #[error("call registry error: {0}")]
    Registry(#[from] voicebridge_call_registry::Error),

    #[error("model session error: {0}")]
    Session(#[from] voicebridge_ai_session::Error),

    /// The call exists in the registry but has no running media units,
    /// so a runtime operation cannot be applied to it.
    #[error("call {0} has no active runtime")]
    NoRuntime(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
