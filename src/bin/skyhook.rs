//! Skyhook agent
//!
//! Exposes a local HTTP or TCP service to the public internet:
//! - Registers a tunnel with the control plane
//! - Connects outward to the assigned relay over a WebSocket
//! - Multiplexes visitor connections and forwards them locally
//! - Reconnects with backoff when the relay connection drops

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use skyhook::api::{ApiClient, TunnelSpec};
use skyhook::config::{self, Config, Credentials};
use skyhook::transport;
use skyhook::tunnel::{run_tunnel, Protocol, TunnelOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Skyhook - share what you're building with the world
#[derive(Parser, Debug)]
#[command(name = "skyhook")]
#[command(about = "Expose a local server to the public internet")]
#[command(version)]
struct Args {
    /// Protocol to tunnel: http or tcp
    protocol: String,

    /// Local port to expose
    port: u16,

    /// Human-readable label for this tunnel
    #[arg(long)]
    name: Option<String>,

    /// Request a specific subdomain
    #[arg(long)]
    subdomain: Option<String>,

    /// Local hostname to forward to (defaults from config, then 127.0.0.1)
    #[arg(long)]
    local_host: Option<String>,

    /// Log each forwarded HTTP request (method, path, status, duration)
    #[arg(long)]
    inspect: bool,

    /// Disable automatic reconnection on disconnect
    #[arg(long)]
    no_reconnect: bool,

    /// Override the control plane API URL
    #[arg(long, env = "SKYHOOK_API_URL")]
    api_url: Option<String>,

    /// API key (overrides stored credentials)
    #[arg(long, env = "SKYHOOK_API_KEY")]
    api_key: Option<String>,

    /// Configuration file path (default: user config dir)
    #[arg(long, default_value = "")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let protocol: Protocol = args.protocol.parse().map_err(|e: String| anyhow!(e))?;
    if args.port == 0 {
        bail!("invalid port number, port must be between 1 and 65535");
    }

    let config_path = config::config_path(&args.config).map_err(|e| anyhow!("{e}"))?;
    let config = Config::load(&config_path).map_err(|e| anyhow!("{e}"))?;
    let credentials = Credentials::load().map_err(|e| anyhow!("{e}"))?;

    // Flag/env > credentials file > config file > built-in default.
    let api_url = args
        .api_url
        .or_else(|| {
            credentials
                .as_ref()
                .map(|c| c.api_url.clone())
                .filter(|url| !url.is_empty())
        })
        .unwrap_or_else(|| config.api_url.clone());

    let api_key = args
        .api_key
        .or_else(|| {
            credentials
                .as_ref()
                .map(|c| c.api_key.clone())
                .filter(|key| !key.is_empty())
        })
        .context("not authenticated: set SKYHOOK_API_KEY or save credentials first")?;

    let local_host = args
        .local_host
        .unwrap_or_else(|| config.default_local_host.clone());

    let api = ApiClient::new(api_url, api_key);

    let tunnel = api
        .create_tunnel(&TunnelSpec {
            protocol: protocol.to_string(),
            local_port: args.port,
            local_host: local_host.clone(),
            name: args.name.unwrap_or_default(),
            subdomain: args.subdomain.unwrap_or_default(),
        })
        .await
        .context("unable to create tunnel")?;

    println!("Tunnel established successfully.");
    println!();
    println!("  Public URL:    {}", tunnel.public_url);
    println!("  Protocol:      {}", tunnel.protocol);
    println!("  Local target:  {}:{}", local_host, args.port);
    println!("  Tunnel ID:     {}", tunnel.id);
    println!("  Status:        {}", tunnel.status);
    println!();

    let conn = match transport::dial_relay(&tunnel.relay_endpoint, &tunnel.session_token).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Failed to connect to relay: {e}");
            std::process::exit(2);
        }
    };
    info!("connected to relay {}", tunnel.relay_endpoint);

    println!("Press Ctrl+C to stop the tunnel.");

    let options = TunnelOptions {
        protocol,
        local_host,
        local_port: args.port,
        inspect: args.inspect || config.inspect,
        auto_reconnect: !args.no_reconnect && config.auto_reconnect,
    };

    match run_tunnel(conn, &tunnel, &api, &options).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    }
}
