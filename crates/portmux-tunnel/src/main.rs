//! PortMux tunnel binary entry point.
//!
//! Dials the shared-link peer over TCP, opens the tunnel on the configured
//! port pair and pumps lifecycle events to the log until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()          -- TOML config, defaults on first run
//!  └─ TcpStream::connect()   -- the shared link transport
//!  └─ Tunnel::open()
//!       ├─ reader task       -- link frames in, dispatch to sockets
//!       ├─ listener task     -- local accepts, forwarder per connection
//!       └─ control task      -- failure handling, event fan-out
//! ```

use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portmux_tunnel::infrastructure::storage::load_config;
use portmux_tunnel::{Tunnel, TunnelEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config first, its log_level seeds the filter unless RUST_LOG wins.
    let config = load_config().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.tunnel.log_level.clone())),
        )
        .init();

    info!("PortMux tunnel starting");

    let transport = tokio::time::timeout(
        Duration::from_secs(config.link.connect_timeout_secs),
        TcpStream::connect(&config.link.peer_address),
    )
    .await
    .with_context(|| format!("timed out dialing link peer {}", config.link.peer_address))?
    .with_context(|| format!("dialing link peer {}", config.link.peer_address))?;

    info!(peer = %config.link.peer_address, "link transport connected");

    let (tunnel, mut events) = Tunnel::new();
    tunnel
        .open(transport, config.tunnel.local_port, config.tunnel.remote_port)
        .await
        .context("opening tunnel")?;

    info!(
        local_port = config.tunnel.local_port,
        remote_port = config.tunnel.remote_port,
        "tunnel ready, press Ctrl-C to exit"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                tunnel.close().await.context("closing tunnel")?;
                break;
            }
            event = events.recv() => {
                match event {
                    Some(TunnelEvent::ConnectionCount(n)) => {
                        info!(connections = n, "connection count changed");
                    }
                    Some(TunnelEvent::LinkStatus { open, active_connections }) => {
                        info!(open, active_connections, "link status changed");
                    }
                    Some(TunnelEvent::Error(reason)) => {
                        warn!(%reason, "tunnel error");
                    }
                    Some(TunnelEvent::Closed) | None => {
                        info!("tunnel closed");
                        break;
                    }
                }
            }
        }
    }

    info!("PortMux tunnel stopped");
    Ok(())
}
