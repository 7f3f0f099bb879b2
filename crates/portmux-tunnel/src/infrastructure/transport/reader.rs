//! The reader/dispatcher task for the shared link.
//!
//! One task owns the read half of the transport.  It pulls whatever byte
//! chunks the link yields, runs them through the incremental
//! [`FrameDecoder`], and dispatches each completed frame: inbound `DATA`
//! goes to the matching local socket, `DISCONNECT` releases the connection,
//! `TERMINATE` ends the session.  Frame boundaries never line up with read
//! boundaries, so the decoder carries partial state between iterations and
//! the loop itself stays oblivious to framing.

use std::sync::Arc;

use portmux_core::{Command, Frame, FrameDecoder};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::infrastructure::registry::Registry;
use crate::infrastructure::transport::TransportWriter;
use crate::infrastructure::{BoxedRead, ControlMsg};

/// Size of the transport read buffer.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Reads frames off the shared link until shutdown, transport failure or a
/// peer `TERMINATE`.
///
/// The read half is returned to the caller on exit so a rebind can hand the
/// same transport to the next session's reader.
pub async fn run_reader(
    mut read_half: BoxedRead,
    registry: Arc<Registry>,
    writer: Arc<TransportWriter>,
    ctrl: mpsc::Sender<ControlMsg>,
    mut shutdown: watch::Receiver<bool>,
) -> BoxedRead {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("reader stopping on shutdown signal");
                    break;
                }
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        let _ = ctrl
                            .send(ControlMsg::TransportFailed("link closed by peer".into()))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        trace!(bytes = n, "link chunk received");
                        for frame in decoder.feed(&buf[..n]) {
                            if !dispatch(frame, &registry, &writer, &ctrl).await {
                                return read_half;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = ctrl
                            .send(ControlMsg::TransportFailed(e.to_string()))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    read_half
}

/// Routes one inbound frame.  Returns `false` when the session must end.
async fn dispatch(
    frame: Frame,
    registry: &Registry,
    writer: &TransportWriter,
    ctrl: &mpsc::Sender<ControlMsg>,
) -> bool {
    match frame.command {
        Command::Data => {
            let Some(id) = frame.connection_id() else {
                warn!("DATA frame too short to carry a connection id, dropped");
                return true;
            };
            let Some(handle) = registry.get(id).await else {
                // Data racing a disconnect we already processed; harmless.
                debug!(id, "DATA for unknown connection dropped");
                return true;
            };
            let body = frame.data_payload();
            let write_result = {
                let mut sock = handle.writer.lock().await;
                sock.write_all(body).await
            };
            if let Err(e) = write_result {
                debug!(id, error = %e, "local socket write failed, disconnecting");
                if registry.remove(id).await.is_some() {
                    handle.stop.notify_one();
                    if let Err(e) = writer.write_frame(&Frame::disconnect(id)).await {
                        let _ = ctrl
                            .send(ControlMsg::TransportFailed(e.to_string()))
                            .await;
                        return false;
                    }
                    let count = registry.active_count().await;
                    let _ = ctrl.send(ControlMsg::ConnectionCount(count)).await;
                }
            }
        }
        Command::Disconnect => {
            let Some(id) = frame.connection_id() else {
                warn!("DISCONNECT frame too short to carry a connection id, dropped");
                return true;
            };
            if let Some(handle) = registry.remove(id).await {
                debug!(id, "peer disconnected connection");
                handle.stop.notify_one();
                let count = registry.active_count().await;
                let _ = ctrl.send(ControlMsg::ConnectionCount(count)).await;
            }
        }
        Command::Terminate => {
            debug!("peer requested tunnel termination");
            let _ = ctrl.send(ControlMsg::PeerTerminated).await;
            return false;
        }
        Command::Connect | Command::LinkUp => {
            // Only the side that owns the listener originates these.
            warn!(command = ?frame.command, "unexpected frame direction, ignored");
        }
    }
    true
}

// ── Tests ─────────────────────────────────────────────────────────────────────
