//! Multiplexing protocol - framed streams over one WebSocket
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream multiplexing with odd/even ID allocation
//! - Automatic PING/PONG handling

mod frame;
mod mux;
mod stream;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use mux::{Mux, Role};
pub use stream::Stream;

use thiserror::Error;

/// Protocol layer errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("mux closed")]
    MuxClosed,

    #[error("stream closed")]
    StreamClosed,

    #[error("too many concurrent streams")]
    TooManyStreams,

    #[error("invalid frame type: {0:#04x}")]
    InvalidFrameType(u8),

    #[error("payload exceeds maximum size: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("truncated frame header")]
    TruncatedHeader,

    #[error("truncated frame payload")]
    TruncatedPayload,
}
