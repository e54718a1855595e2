//! Minimal-profile RTP packet encoding and decoding.
//!
//! The wire format is the fixed 12-byte RTP header (RFC 3550) followed by
//! the audio payload. Only the minimal profile used between the telephony
//! switch and this relay is supported: version 2, no header extensions,
//! CSRC entries skipped on input and never written on output. Padding is
//! honored on input.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version carried in every packet.
pub const RTP_VERSION: u8 = 2;

/// Size of the fixed RTP header in bytes.
pub const RTP_HEADER_SIZE: usize = 12;

/// Fixed RTP header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version (always 2 for packets we build).
    pub version: u8,
    /// Marker bit; set on the first packet of a talkspurt.
    pub marker: bool,
    /// 7-bit payload type.
    pub payload_type: u8,
    /// 16-bit sequence number, wrapping.
    pub sequence_number: RtpSequenceNumber,
    /// 32-bit media timestamp, wrapping.
    pub timestamp: RtpTimestamp,
    /// Stream (synchronization source) identifier.
    pub ssrc: RtpSsrc,
}

impl RtpHeader {
    /// Create a header for an outbound packet.
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
        }
    }
}

/// One RTP packet: fixed header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Parse a datagram as a minimal-profile RTP packet.
    ///
    /// Rejects packets shorter than the fixed header, with a version other
    /// than 2, or carrying a header extension. CSRC entries are skipped.
    /// If the padding bit is set the trailing pad bytes are stripped from
    /// the payload.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < RTP_HEADER_SIZE {
            return Err(Error::MalformedPacket("datagram shorter than RTP header"));
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(Error::MalformedPacket("unsupported RTP version"));
        }

        let padding = (buf[0] >> 5) & 0x01 == 1;
        let extension = (buf[0] >> 4) & 0x01 == 1;
        if extension {
            return Err(Error::MalformedPacket("header extensions not supported"));
        }

        let csrc_count = (buf[0] & 0x0F) as usize;
        let payload_offset = RTP_HEADER_SIZE + csrc_count * 4;
        if buf.len() < payload_offset {
            return Err(Error::MalformedPacket("truncated CSRC list"));
        }

        let marker = buf[1] >> 7 == 1;
        let payload_type = buf[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut payload_end = buf.len();
        if padding {
            let pad_len = buf[buf.len() - 1] as usize;
            if pad_len == 0 || payload_offset + pad_len > buf.len() {
                return Err(Error::MalformedPacket("invalid padding length"));
            }
            payload_end -= pad_len;
        }

        Ok(Self {
            header: RtpHeader {
                version,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
            },
            payload: Bytes::copy_from_slice(&buf[payload_offset..payload_end]),
        })
    }

    /// Serialize into a datagram. Always writes a 12-byte header with no
    /// padding, extension, or CSRC entries.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8((u8::from(self.header.marker) << 7) | (self.header.payload_type & 0x7F));
        buf.put_u16(self.header.sequence_number);
        buf.put_u32(self.header.timestamp);
        buf.put_u32(self.header.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
