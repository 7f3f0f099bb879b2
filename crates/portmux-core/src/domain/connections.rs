//! Bounded, growable registry mapping connection identifiers to live handles.
//!
//! # Why a table and not a `HashMap`? (for beginners)
//!
//! Connection identifiers travel over the wire as 16-bit integers, and the
//! peer indexes its own mirrored sockets with the same values.  Keeping ids
//! dense and small matters: the backing storage is a slot vector indexed by
//! the id itself, which makes lookups trivial and keeps the wire format
//! compact.  The vector starts small (40 slots) and doubles when it fills
//! up, never exceeding a hard cap of 640 simultaneous connections; beyond
//! that, allocation fails and the caller applies its own backpressure.
//!
//! The table is the single source of truth for which connections are open:
//! the listener consults it to allocate, the dispatcher to route, and the
//! forwarders to release.  An id is never reused while its connection is
//! open, because allocation only ever hands out slots that are currently
//! empty.

use thiserror::Error;

/// A 16-bit tag distinguishing one multiplexed connection from another.
pub type ConnectionId = u16;

/// Number of id slots a fresh table starts with.
pub const INITIAL_CAPACITY: usize = 40;

/// Maximum simultaneous connection identifiers; allocation fails beyond this.
pub const HARD_CONNECTION_LIMIT: usize = 640;

/// Errors returned by table operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    /// Every id up to the hard cap is in use.
    #[error("all {HARD_CONNECTION_LIMIT} connection identifiers are in use")]
    Exhausted,
}

/// Registry of open connections, indexed by [`ConnectionId`].
///
/// Generic over the handle type `H` so this crate stays free of socket and
/// runtime types; the engine instantiates it with its own per-connection
/// handle.  All operations are plain `&mut self`; the caller provides the
/// mutual exclusion (one lock around the whole table).
#[derive(Debug)]
pub struct ConnectionTable<H> {
    slots: Vec<Option<H>>,
    active: usize,
}

impl<H> ConnectionTable<H> {
    /// Creates an empty table with [`INITIAL_CAPACITY`] slots.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(INITIAL_CAPACITY);
        slots.resize_with(INITIAL_CAPACITY, || None);
        Self { slots, active: 0 }
    }

    /// Reserves nothing; finds the next free id.
    ///
    /// Scans from the current active count upward (wrapping modulo the
    /// capacity) for the first unused id.  With N connections open the
    /// first N slots are usually taken, so this starts the scan where a
    /// free slot is most likely.  If the table is full and below the hard
    /// cap, capacity doubles and the scan retries.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Exhausted`] when all [`HARD_CONNECTION_LIMIT`]
    /// ids are active.
    pub fn allocate(&mut self) -> Result<ConnectionId, TableError> {
        if let Some(id) = self.scan_free() {
            return Ok(id);
        }

        if self.slots.len() >= HARD_CONNECTION_LIMIT {
            return Err(TableError::Exhausted);
        }

        let new_capacity = (self.slots.len() * 2).min(HARD_CONNECTION_LIMIT);
        self.slots.resize_with(new_capacity, || None);
        self.scan_free().ok_or(TableError::Exhausted)
    }

    /// Records `handle` as the live connection for `id`.
    ///
    /// Replaces (and returns) any handle previously stored under the same
    /// id; with ids coming from [`allocate`](Self::allocate) the slot is
    /// always empty.
    pub fn insert(&mut self, id: ConnectionId, handle: H) -> Option<H> {
        let slot = &mut self.slots[id as usize];
        let previous = slot.replace(handle);
        if previous.is_none() {
            self.active += 1;
        }
        previous
    }

    /// Looks up the handle for `id`, if that connection is open.
    pub fn get(&self, id: ConnectionId) -> Option<&H> {
        self.slots.get(id as usize)?.as_ref()
    }

    /// Releases `id`, returning its handle if the connection was still open.
    ///
    /// Safe to call twice for the same id: the second call returns `None`,
    /// which is how callers make disconnection at-most-once.
    pub fn remove(&mut self, id: ConnectionId) -> Option<H> {
        let handle = self.slots.get_mut(id as usize)?.take();
        if handle.is_some() {
            self.active -= 1;
        }
        handle
    }

    /// Removes every open connection, returning `(id, handle)` pairs.
    pub fn drain(&mut self) -> Vec<(ConnectionId, H)> {
        let mut drained = Vec::with_capacity(self.active);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(handle) = slot.take() {
                drained.push((index as ConnectionId, handle));
            }
        }
        self.active = 0;
        drained
    }

    /// Number of currently open connections.
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Current slot capacity (between [`INITIAL_CAPACITY`] and the hard cap).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn scan_free(&self) -> Option<ConnectionId> {
        let capacity = self.slots.len();
        (0..capacity)
            .map(|offset| (self.active + offset) % capacity)
            .find(|&index| self.slots[index].is_none())
            .map(|index| index as ConnectionId)
    }
}

impl<H> Default for ConnectionTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
