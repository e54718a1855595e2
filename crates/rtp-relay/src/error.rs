//! Error types for the RTP transport layer.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the RTP transport layer.
///
/// Transport-level errors (`MalformedPacket`, `StreamBindingMismatch`) are
/// recovered locally by the receiver — dropped and counted — and never
/// surface past it. `PoolExhausted` is the back-pressure signal that a call
/// must be rejected.
#[derive(Debug, Error)]
pub enum Error {
    /// The configured pool range is empty or runs past the top of the
    /// UDP port space.
    #[error("invalid port range: {size} ports starting at {first_port}")]
    InvalidPortRange { first_port: u16, size: u16 },

    /// No free port remains in the pool.
    #[error("port pool exhausted ({leased} of {size} ports leased)")]
    PoolExhausted { size: usize, leased: usize },

    /// A release was attempted by a call that does not hold the lease.
    #[error("port {port} is not leased by call {call_key}")]
    PortNotOwned { port: u16, call_key: String },

    /// The datagram could not be parsed as a minimal-profile RTP packet.
    #[error("malformed RTP packet: {0}")]
    MalformedPacket(&'static str),

    /// An inbound packet did not match the call's learned stream binding.
    #[error("packet from {source_addr} (ssrc {ssrc:#010x}) does not match stream binding")]
    StreamBindingMismatch { source_addr: SocketAddr, ssrc: u32 },

    /// Socket-level I/O failure.
    #[error("media transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The downstream audio channel is gone; the call is tearing down.
    #[error("media channel closed")]
    ChannelClosed,
}

/// Result type for RTP transport operations.
pub type Result<T> = std::result::Result<T, Error>;
