//! Per-call RTP transport for voicebridge.
//!
//! This crate owns the UDP side of a bridged call: the RTP packet codec,
//! the fixed-range port pool that hands one exclusive port to each active
//! call, the media receiver that ingests and batches caller audio, and the
//! paced media sender that plays model audio back toward the switch.
//!
//! One receiver and one sender exist per call and share a single socket
//! (symmetric RTP). Nothing in this crate is shared across calls except the
//! [`PortPool`].

pub mod alloc;
pub mod error;
pub mod filter;
pub mod packet;
pub mod receiver;
pub mod sender;

pub use alloc::{PoolStats, PortLease, PortPool};
pub use error::{Error, Result};
pub use filter::{AudioPreFilter, EnergyGateConfig, EnergyGateFilter, NoopFilter};
pub use packet::{RtpHeader, RtpPacket, RTP_HEADER_SIZE, RTP_VERSION};
pub use receiver::{
    MediaReceiver, MediaReceiverHandle, ReceiverConfig, ReceiverStats, ReceiverStatsSnapshot,
    StreamBinding,
};
pub use sender::{
    DrainPolicy, MediaSender, MediaSenderHandle, SenderConfig, SenderStats, SenderStatsSnapshot,
};

/// RTP sequence number type (16-bit, wrapping).
pub type RtpSequenceNumber = u16;

/// RTP timestamp type (32-bit, wrapping).
pub type RtpTimestamp = u32;

/// RTP synchronization source identifier.
pub type RtpSsrc = u32;
