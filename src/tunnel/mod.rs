//! Tunnel layer - forwarding and connection lifecycle
//!
//! Provides:
//! - HTTP and TCP forwarders bridging streams to the local server
//! - Exponential-backoff reconnection
//! - The tunnel loop driving accept/forward/reconnect

mod forwarder;
mod reconnect;
mod run;

pub use forwarder::{forward_http, forward_tcp};
pub use reconnect::reconnect;
pub use run::{run_tunnel, Protocol, TunnelOptions};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("connection to relay lost")]
    ConnectionLost,

    #[error("unable to reconnect after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
