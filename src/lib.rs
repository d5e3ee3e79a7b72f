//! # Skyhook
//!
//! A client-side tunneling agent that exposes a local HTTP or TCP service
//! to the public internet. The agent connects *outward* to a relay over a
//! single WebSocket, multiplexes many independent visitor connections
//! across that one connection, and forwards each to the local server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Tunnel Loop                        │
//! │     (accept streams, spawn forwarders, reconnect)    │
//! ├─────────────────────────────────────────────────────┤
//! │                    Forwarders                        │
//! │        (HTTP request proxying, TCP byte copy)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing Layer                   │
//! │      (framed streams, accept queue, write queue)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │            (WebSocket to the relay endpoint)         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod protocol;
pub mod transport;
pub mod tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Configuration error: {0}")]
    Config(String),
}
