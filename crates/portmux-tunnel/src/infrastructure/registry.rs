//! Engine-side view of the connection table.
//!
//! [`Registry`] wraps the pure [`ConnectionTable`] from `portmux-core` in a
//! single mutex: every structural mutation (allocate, insert, remove, drain)
//! takes the same lock, so the table is the one source of truth consulted by
//! the listener (to allocate), the dispatcher (to route) and the forwarders
//! (to release).  Lock holds never span an `.await` on socket I/O; handles
//! are cloned out and used after release.

use std::sync::Arc;

use portmux_core::{ConnectionId, ConnectionTable, TableError};
use tokio::sync::{Mutex, Notify};

use crate::infrastructure::BoxedWrite;

/// Per-connection handle stored in the table.
///
/// The forwarder task owns the local socket's read half; everything anyone
/// else needs lives here: the write half (for inbound `DATA`) and a stop
/// signal that interrupts the forwarder's pending read when the peer or a
/// tunnel teardown closes the connection out from under it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub writer: Arc<Mutex<BoxedWrite>>,
    pub stop: Arc<Notify>,
}

impl ConnectionHandle {
    /// Wraps a local socket's write half into a shareable handle.
    pub fn new(writer: BoxedWrite) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            stop: Arc::new(Notify::new()),
        }
    }
}

/// The engine's locked connection table.
pub struct Registry {
    table: Mutex<ConnectionTable<ConnectionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(ConnectionTable::new()),
        }
    }

    /// Finds the next free connection id.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Exhausted`] when the hard cap is reached; the
    /// listener applies its bounded retry policy on top of this.
    pub async fn allocate(&self) -> Result<ConnectionId, TableError> {
        self.table.lock().await.allocate()
    }

    /// Records a live connection under `id`.
    pub async fn insert(&self, id: ConnectionId, handle: ConnectionHandle) {
        self.table.lock().await.insert(id, handle);
    }

    /// Clones out the handle for `id`, if that connection is open.
    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.table.lock().await.get(id).cloned()
    }

    /// Releases `id`.  Returns `None` if it was already released, which
    /// callers use to make the disconnect sequence at-most-once.
    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.table.lock().await.remove(id)
    }

    /// Releases every open connection at once (tunnel teardown / rebind).
    pub async fn drain(&self) -> Vec<(ConnectionId, ConnectionHandle)> {
        self.table.lock().await.drain()
    }

    /// Number of currently open connections.
    pub async fn active_count(&self) -> usize {
        self.table.lock().await.active_count()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
