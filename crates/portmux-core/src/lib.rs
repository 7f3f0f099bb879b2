//! # portmux-core
//!
//! Shared library for PortMux containing the wire framing protocol and the
//! connection-identifier registry.
//!
//! This crate is used by the tunnel engine and by any peer implementation.
//! It has zero dependencies on OS APIs, async runtimes, or network sockets.
//!
//! # Architecture overview (for beginners)
//!
//! PortMux turns one shared, ordered byte-stream link (for example a USB
//! accessory channel) into many independent TCP connections.  Every local
//! connection is tagged with a 16-bit id; its traffic is chopped into frames
//! that travel over the single link interleaved with every other
//! connection's frames, and the peer demultiplexes them back into real
//! sockets on its side.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the link.  Frames are encoded
//!   into a compact binary format (4-byte header + payload) and reassembled
//!   on the receiving side by an incremental decoder that tolerates any
//!   fragmentation the link chooses.
//!
//! - **`domain`** – Pure bookkeeping with no I/O.  The most important piece
//!   is the `ConnectionTable`: a bounded, growable registry mapping each
//!   connection id to its live local-socket handle.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `portmux_core::Frame` instead of `portmux_core::protocol::frames::Frame`.
pub use domain::connections::{ConnectionId, ConnectionTable, TableError, HARD_CONNECTION_LIMIT};
pub use protocol::codec::{encode_frame, FrameDecoder, ProtocolError};
pub use protocol::frames::{Command, Frame, PayloadTooLarge, HEADER_SIZE, MAX_DATA_CHUNK, MAX_PAYLOAD};
