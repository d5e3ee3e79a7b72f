//! Relay reconnection with exponential backoff

use super::TunnelError;
use crate::transport::{self, RelayConn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 10;

/// Re-establish the relay connection after a loss.
///
/// Sleeps before every attempt, doubling the delay from 1 s up to a 30 s
/// cap, and gives up after 10 failed dials. Cancellation is honored
/// between attempts.
pub async fn reconnect(
    endpoint: &str,
    session_token: &str,
    cancel: &CancellationToken,
) -> Result<RelayConn, TunnelError> {
    warn!("connection lost, reconnecting");

    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        debug!("reconnection attempt {attempt}/{MAX_ATTEMPTS} (waiting {backoff:?})");

        tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }

        match transport::dial_relay(endpoint, session_token).await {
            Ok(conn) => {
                info!("reconnected successfully");
                return Ok(conn);
            }
            Err(e) => debug!("attempt {attempt} failed: {e}"),
        }

        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    Err(TunnelError::ReconnectExhausted(MAX_ATTEMPTS))
}
