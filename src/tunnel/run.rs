//! Tunnel loop - ties the multiplexer, forwarders, and reconnection
//! together for the lifetime of one exposed tunnel.

use super::forwarder::{forward_http, forward_tcp};
use super::reconnect::reconnect;
use super::TunnelError;
use crate::api::{ApiClient, TunnelInfo};
use crate::protocol::{Mux, Role};
use crate::transport::RelayConn;
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Which forwarder handles accepted streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Tcp,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            _ => Err(format!("invalid protocol '{s}', must be 'http' or 'tcp'")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Settings for one tunnel run.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub protocol: Protocol,
    pub local_host: String,
    pub local_port: u16,
    pub inspect: bool,
    pub auto_reconnect: bool,
}

/// Drive the tunnel until interrupted or the connection is lost beyond
/// recovery.
///
/// Each pass wraps the relay connection in a mux and accepts streams,
/// spawning one forwarder per stream. On SIGINT the control plane is
/// notified best-effort and the mux closed cleanly. On connection loss the
/// relay is re-dialed with backoff and a fresh mux built around the new
/// connection; an unrecovered loss surfaces as an error.
pub async fn run_tunnel(
    mut conn: RelayConn,
    tunnel: &TunnelInfo,
    api: &ApiClient,
    options: &TunnelOptions,
) -> Result<(), TunnelError> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    loop {
        let mux = Mux::new(conn, Role::Client);

        // The relay drives liveness; the mux answers its PINGs
        // automatically and the callback is informational only.
        mux.on_pong(|| trace!("heartbeat: pong received"));

        let graceful = accept_streams(&mux, &shutdown, options).await;

        if graceful {
            info!("shutting down");
            if let Err(e) = api.stop_tunnel(&tunnel.id).await {
                debug!("stop notification failed: {e}");
            }
            mux.close().await;
            return Ok(());
        }

        mux.close().await;

        if !options.auto_reconnect {
            return Err(TunnelError::ConnectionLost);
        }
        conn = reconnect(&tunnel.relay_endpoint, &tunnel.session_token, &shutdown).await?;
    }
}

/// Accept streams until shutdown or connection loss. Returns true for a
/// graceful (interrupt-driven) exit, false when the mux died under us.
async fn accept_streams(
    mux: &Mux,
    shutdown: &CancellationToken,
    options: &TunnelOptions,
) -> bool {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return true,
            stream = mux.accept_stream() => match stream {
                Ok(stream) => stream,
                Err(_) => return shutdown.is_cancelled(),
            },
        };

        debug!("accepted stream {}", stream.id());
        match options.protocol {
            Protocol::Http => {
                tokio::spawn(forward_http(
                    stream,
                    options.local_host.clone(),
                    options.local_port,
                    options.inspect,
                ));
            }
            Protocol::Tcp => {
                tokio::spawn(forward_tcp(
                    stream,
                    options.local_host.clone(),
                    options.local_port,
                ));
            }
        }
    }
}
