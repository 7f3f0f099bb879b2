//! Local accept loop and per-connection forwarders.
//!
//! The listener owns the local TCP socket.  For every accepted connection
//! it allocates an id, announces it to the peer with a `CONNECT` frame and
//! spawns a forwarder task that pumps bytes from the local socket into
//! `DATA` frames on the link.  The forwarder is the only task reading that
//! socket; inbound bytes take the reverse path through the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use portmux_core::{ConnectionId, Frame};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::infrastructure::registry::{ConnectionHandle, Registry};
use crate::infrastructure::transport::TransportWriter;
use crate::infrastructure::ControlMsg;

/// Size of each forwarder's socket read buffer.  Always below the DATA
/// frame payload limit, so one read maps to one frame.
const FORWARD_BUF_SIZE: usize = 8192;

/// How many times to retry id allocation when the table is full.
const ALLOCATE_RETRIES: u32 = 40;

/// Pause between allocation retries.
const ALLOCATE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Accepts local connections until the shutdown signal fires.
///
/// The listener socket is bound by the caller before the session starts,
/// so a bad port surfaces as an `open` error instead of a background log
/// line.
pub async fn run_listener(
    listener: TcpListener,
    registry: Arc<Registry>,
    writer: Arc<TransportWriter>,
    ctrl: mpsc::Sender<ControlMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("listener stopping on shutdown signal");
                    return;
                }
            }
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "local connection accepted");

                let Some(id) = allocate_with_retry(&registry, &mut shutdown).await else {
                    warn!(%peer, "connection table exhausted, dropping connection");
                    continue;
                };

                let (read_half, write_half) = socket.into_split();
                let handle = ConnectionHandle::new(Box::new(write_half));
                registry.insert(id, handle.clone()).await;

                if let Err(e) = writer.write_frame(&Frame::connect(id)).await {
                    let _ = ctrl.send(ControlMsg::TransportFailed(e.to_string())).await;
                    return;
                }
                info!(id, %peer, "connection opened");
                let count = registry.active_count().await;
                let _ = ctrl.send(ControlMsg::ConnectionCount(count)).await;

                tokio::spawn(run_forwarder(
                    id,
                    read_half,
                    handle,
                    Arc::clone(&registry),
                    Arc::clone(&writer),
                    ctrl.clone(),
                ));
            }
        }
    }
}

/// Tries to allocate an id, waiting out short bursts at the hard cap.
///
/// Gives up after the retry limit or when shutdown fires, returning
/// `None` so the caller drops just this one connection.
async fn allocate_with_retry(
    registry: &Registry,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<ConnectionId> {
    for attempt in 0..ALLOCATE_RETRIES {
        match registry.allocate().await {
            Ok(id) => return Some(id),
            Err(_) if *shutdown.borrow() => return None,
            Err(_) => {
                if attempt == 0 {
                    warn!("connection table full, waiting for a free slot");
                }
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return None;
                        }
                    }
                    _ = tokio::time::sleep(ALLOCATE_RETRY_DELAY) => {}
                }
            }
        }
    }
    None
}

/// Pumps bytes from one local socket into `DATA` frames.
///
/// Exits silently when the stop signal fires (the connection was already
/// released elsewhere) and with a `DISCONNECT` announcement when the local
/// side closes first.
pub async fn run_forwarder<R>(
    id: ConnectionId,
    mut read_half: R,
    handle: ConnectionHandle,
    registry: Arc<Registry>,
    writer: Arc<TransportWriter>,
    ctrl: mpsc::Sender<ControlMsg>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; FORWARD_BUF_SIZE];

    loop {
        tokio::select! {
            _ = handle.stop.notified() => {
                debug!(id, "forwarder stopped by signal");
                return;
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        if let Err(e) = &result {
                            debug!(id, error = %e, "local socket read failed");
                        }
                        break;
                    }
                    Ok(n) => {
                        // Cannot overflow a frame, n is capped by the buffer.
                        let frame = Frame::data(id, &buf[..n])
                            .expect("read buffer within frame limit");
                        if let Err(e) = writer.write_frame(&frame).await {
                            let _ = ctrl
                                .send(ControlMsg::TransportFailed(e.to_string()))
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }

    // Local side closed first; release the id and tell the peer, unless
    // someone else already did.
    if registry.remove(id).await.is_some() {
        info!(id, "connection closed locally");
        if let Err(e) = writer.write_frame(&Frame::disconnect(id)).await {
            let _ = ctrl.send(ControlMsg::TransportFailed(e.to_string())).await;
            return;
        }
        let count = registry.active_count().await;
        let _ = ctrl.send(ControlMsg::ConnectionCount(count)).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
