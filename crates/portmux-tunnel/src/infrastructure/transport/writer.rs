//! Serialized writes to the shared link.
//!
//! Every task that wants to put a frame on the wire (forwarders, the
//! listener announcing a CONNECT, the dispatcher answering with a
//! DISCONNECT, the supervisor's TERMINATE) goes through one
//! [`TransportWriter`].  The frame is encoded first, then the write half is
//! locked and the complete encoding written in one guarded critical
//! section, so frames from concurrent producers never interleave on the
//! byte stream.

use std::io;

use portmux_core::{encode_frame, Frame};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::trace;

use crate::infrastructure::BoxedWrite;

/// Owns the write half of the shared link and serializes access to it.
pub struct TransportWriter {
    write_half: Mutex<BoxedWrite>,
}

impl TransportWriter {
    pub fn new(write_half: BoxedWrite) -> Self {
        Self {
            write_half: Mutex::new(write_half),
        }
    }

    /// Encodes `frame` and writes it to the link as one atomic unit.
    ///
    /// Encoding happens before the lock is taken, so an oversized frame
    /// fails without touching the stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the link write fails; the
    /// caller treats that as fatal to the whole tunnel.
    pub async fn write_frame(&self, frame: &Frame) -> io::Result<()> {
        let bytes = encode_frame(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut guard = self.write_half.lock().await;
        guard.write_all(&bytes).await?;
        guard.flush().await?;
        trace!(command = ?frame.command, len = bytes.len(), "frame written to link");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
