//! Relay transport - WebSocket connection establishment
//!
//! The relay authenticates the session at dial time: the session token is
//! carried as a query parameter on the WebSocket URL and no in-band
//! handshake frames exist.

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

/// An established connection to the relay.
pub type RelayConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maximum inbound message size: one frame header over the 10 MiB payload
/// cap, so a maximal DATA frame still fits in a single message.
pub const READ_LIMIT: usize = 11 * 1024 * 1024;

/// How long a relay dial may take before it is abandoned.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out dialing relay")]
    DialTimeout,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Build the dial URL for `endpoint`, attaching the session token as a
/// query parameter.
pub fn relay_url(endpoint: &str, session_token: &str) -> String {
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{sep}session_token={session_token}")
}

/// Dial the relay WebSocket endpoint, authenticating with `session_token`.
pub async fn dial_relay(endpoint: &str, session_token: &str) -> Result<RelayConn, TransportError> {
    let url = relay_url(endpoint, session_token);
    let config = WebSocketConfig::default()
        .max_message_size(Some(READ_LIMIT))
        .max_frame_size(Some(READ_LIMIT));

    let (conn, _response) =
        tokio::time::timeout(DIAL_TIMEOUT, connect_async_with_config(url, Some(config), false))
            .await
            .map_err(|_| TransportError::DialTimeout)??;

    Ok(conn)
}
