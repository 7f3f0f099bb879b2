//! Infrastructure services for the tunnel engine: the shared-link I/O tasks,
//! the local listener, the connection registry, and configuration storage.

pub mod listener;
pub mod registry;
pub mod storage;
pub mod transport;

use tokio::io::{AsyncRead, AsyncWrite};

/// Read half of the shared link, type-erased so a session can store it and
/// hand it between reader incarnations on a rebind.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of the shared link.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Messages flowing from the I/O tasks up to the supervisor.
///
/// The I/O tasks never talk to the host directly; they report here and the
/// supervisor decides what survives (a count update) and what is fatal to
/// the whole tunnel (a transport failure, a peer TERMINATE).
#[derive(Debug)]
pub enum ControlMsg {
    /// A read or write on the shared link failed; the tunnel must close.
    TransportFailed(String),
    /// The peer sent `TERMINATE`; orderly shutdown.
    PeerTerminated,
    /// The number of open connections changed.
    ConnectionCount(usize),
}
