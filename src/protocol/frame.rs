//! Frame encoding/decoding for the multiplexing protocol
//!
//! Frame format, big-endian:
//! ```text
//! +--------+-----------------+-----------------+------------------+
//! |  Type  |  Stream ID (4B) | Payload Len (4B)|     Payload      |
//! +--------+-----------------+-----------------+------------------+
//! ```
//!
//! Each WebSocket message carries exactly one frame.

use super::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes: 1 (type) + 4 (stream_id) + 4 (payload_len)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum allowed payload size (10 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// New stream announcement
    OpenStream = 0x01,
    /// Stream payload
    Data = 0x02,
    /// Stream teardown
    CloseStream = 0x03,
    /// Keepalive request
    Ping = 0x04,
    /// Keepalive response
    Pong = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::OpenStream),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::CloseStream),
            0x04 => Ok(FrameType::Ping),
            0x05 => Ok(FrameType::Pong),
            _ => Err(ProtocolError::InvalidFrameType(value)),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 is reserved for PING/PONG)
    pub stream_id: u32,
    /// Payload data; empty for all types except DATA
    pub payload: Bytes,
}

impl Frame {
    /// Create a stream open frame
    pub fn open_stream(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::OpenStream,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream close frame
    pub fn close_stream(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::CloseStream,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Encode the frame into its wire representation.
    /// Allocates once; header and payload land in one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode exactly one frame from `buf`.
    ///
    /// The header is validated before the payload is touched: an unknown
    /// type byte or an oversized length fails without reading past the
    /// 9-byte header, and no payload buffer is allocated until the length
    /// check passes.
    pub fn decode(mut buf: impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::TruncatedHeader);
        }

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let stream_id = buf.get_u32();
        let payload_len = buf.get_u32() as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }
        if buf.remaining() < payload_len {
            return Err(ProtocolError::TruncatedPayload);
        }

        Ok(Self {
            frame_type,
            stream_id,
            payload: buf.copy_to_bytes(payload_len),
        })
    }
}
