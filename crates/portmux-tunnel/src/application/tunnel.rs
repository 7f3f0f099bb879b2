//! Tunnel lifecycle supervisor.
//!
//! [`Tunnel`] is the one entry point the host talks to.  `open` takes
//! ownership of a transport (any ordered duplex byte stream), binds the
//! local listener and starts the session's background tasks; `close` tears
//! everything down in a fixed order and leaves the tunnel reusable.  All
//! state transitions happen under one mutex, so open, close and the
//! failure path racing from the control task serialize cleanly and each
//! teardown runs at most once.
//!
//! Lifecycle events stream out of the receiver returned by [`Tunnel::new`];
//! the host listens there for connection counts, link status changes and
//! fatal errors.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use portmux_core::Frame;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::infrastructure::listener::run_listener;
use crate::infrastructure::registry::Registry;
use crate::infrastructure::transport::{run_reader, TransportWriter};
use crate::infrastructure::{BoxedRead, ControlMsg};

/// How long to wait for the listener task to acknowledge shutdown.
const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_millis(100);

/// How long to wait for the reader task to hand back the transport's read
/// half.  Longer than the listener's, the reader may be mid-dispatch.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a best-effort TERMINATE write may block teardown.
const TERMINATE_TIMEOUT: Duration = Duration::from_millis(100);

/// Capacity of the event channel to the host.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the control channel from the I/O tasks.
const CTRL_CHANNEL_CAPACITY: usize = 32;

// ── Public types ──────────────────────────────────────────────────────────────

/// Where the tunnel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Events reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The link came up or went down, with the connection count at that
    /// moment.
    LinkStatus {
        open: bool,
        active_connections: usize,
    },
    /// The number of open connections changed.
    ConnectionCount(usize),
    /// Something fatal happened; a teardown follows.
    Error(String),
    /// The tunnel finished closing.
    Closed,
}

/// Errors surfaced directly from `open` and `close`.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The local listener port could not be bound.
    #[error("failed to bind local listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// A write on the shared link failed.
    #[error("transport write failed: {0}")]
    Transport(#[from] io::Error),
}

// ── Session internals ─────────────────────────────────────────────────────────

/// One live multiplexing session over one transport.
struct Session {
    local_port: u16,
    remote_port: u16,
    registry: Arc<Registry>,
    writer: Arc<TransportWriter>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<SessionTasks>,
}

struct SessionTasks {
    listener: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<BoxedRead>>,
    control: Option<JoinHandle<()>>,
}

struct Inner {
    state: LinkState,
    session: Option<Arc<Session>>,
}

// ── Tunnel ────────────────────────────────────────────────────────────────────

/// Supervises the tunnel lifecycle and its background tasks.
pub struct Tunnel {
    events: mpsc::Sender<TunnelEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl Tunnel {
    /// Creates a closed tunnel and the event stream the host listens on.
    pub fn new() -> (Self, mpsc::Receiver<TunnelEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let tunnel = Self {
            events,
            inner: Arc::new(Mutex::new(Inner {
                state: LinkState::Closed,
                session: None,
            })),
        };
        (tunnel, events_rx)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LinkState {
        self.inner.lock().await.state
    }

    /// Number of open connections, zero when closed.
    pub async fn active_connections(&self) -> usize {
        let registry = {
            let inner = self.inner.lock().await;
            match &inner.session {
                Some(s) => Arc::clone(&s.registry),
                None => return 0,
            }
        };
        registry.active_count().await
    }

    /// Opens the tunnel over `transport`, listening on `local_port` and
    /// asking the peer to target `remote_port`.
    ///
    /// Calling `open` while already open with the same port pair is a
    /// no-op (the supplied transport is dropped).  A different port pair
    /// rebinds: existing connections are flushed with per-connection
    /// disconnects, the same transport keeps carrying the new session,
    /// and the new remote port is announced.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Bind`] when the local port cannot be bound
    /// and [`TunnelError::Transport`] when the link rejects the opening
    /// announcement.
    pub async fn open<T>(
        &self,
        transport: T,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), TunnelError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut inner = self.inner.lock().await;

        if let Some(session) = &inner.session {
            if session.local_port == local_port && session.remote_port == remote_port {
                debug!(local_port, remote_port, "tunnel already open on these ports");
                return Ok(());
            }
            // Port change: keep the existing transport, replace the session.
            let current = Arc::clone(session);
            return self
                .rebind(&mut inner, current, local_port, remote_port)
                .await;
        }

        inner.state = LinkState::Opening;

        let listener = match bind_listener(local_port).await {
            Ok(l) => l,
            Err(e) => {
                inner.state = LinkState::Closed;
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(transport);
        let writer = Arc::new(TransportWriter::new(Box::new(write_half)));

        if let Err(e) = writer.write_frame(&Frame::link_up(remote_port as u32)).await {
            inner.state = LinkState::Closed;
            return Err(TunnelError::Transport(e));
        }

        let session = self
            .start_session(
                Box::new(read_half),
                writer,
                listener,
                local_port,
                remote_port,
            )
            .await;
        inner.session = Some(session);
        inner.state = LinkState::Open;
        info!(local_port, remote_port, "tunnel open");
        self.emit(TunnelEvent::LinkStatus {
            open: true,
            active_connections: 0,
        });
        Ok(())
    }

    /// Closes the tunnel, disconnecting every open connection and dropping
    /// the transport.  Closing an already-closed tunnel is a no-op.
    pub async fn close(&self) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.take() else {
            return Ok(());
        };
        inner.state = LinkState::Closing;
        info!("tunnel closing");

        shutdown_session(&session, true).await;

        inner.state = LinkState::Closed;
        drop(inner);

        // The close notification must not be lost to a backlogged host, so
        // these two sends wait for channel space with the lock released.
        let _ = self
            .events
            .send(TunnelEvent::LinkStatus {
                open: false,
                active_connections: 0,
            })
            .await;
        let _ = self.events.send(TunnelEvent::Closed).await;
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Replaces the session behind an already-open tunnel with one on new
    /// ports, recycling the transport.  Caller holds the state lock.
    async fn rebind(
        &self,
        inner: &mut Inner,
        current: Arc<Session>,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), TunnelError> {
        // Bind the new listener first so a bad port leaves the running
        // session untouched.
        let listener = bind_listener(local_port).await?;
        inner.state = LinkState::Opening;
        inner.session = None;

        info!(local_port, remote_port, "rebinding tunnel to new ports");

        // Announce each connection's end individually; the link stays up.
        let _ = current.shutdown.send(true);
        let mut link_error: Option<io::Error> = None;
        for (id, handle) in current.registry.drain().await {
            handle.stop.notify_one();
            if link_error.is_none() {
                if let Err(e) = current.writer.write_frame(&Frame::disconnect(id)).await {
                    warn!(error = %e, "transport failed during rebind");
                    link_error = Some(e);
                }
            }
        }
        if let Some(e) = link_error {
            stop_tasks(&current).await;
            inner.state = LinkState::Closed;
            self.emit(TunnelEvent::Error(e.to_string()));
            self.emit(TunnelEvent::Closed);
            return Err(TunnelError::Transport(e));
        }

        let (listener_handle, reader_handle, _control_handle) = take_tasks(&current).await;
        join_or_abort(listener_handle, LISTENER_JOIN_TIMEOUT).await;

        let Some(read_half) = join_reader(reader_handle).await else {
            // The read half is gone; the transport cannot be reused.
            error!("reader did not stop in time, closing tunnel");
            inner.state = LinkState::Closed;
            self.emit(TunnelEvent::Error("reader stalled during rebind".into()));
            self.emit(TunnelEvent::Closed);
            return Err(TunnelError::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "reader stalled during rebind",
            )));
        };

        let writer = Arc::clone(&current.writer);
        if let Err(e) = writer.write_frame(&Frame::link_up(remote_port as u32)).await {
            inner.state = LinkState::Closed;
            self.emit(TunnelEvent::Error(e.to_string()));
            self.emit(TunnelEvent::Closed);
            return Err(TunnelError::Transport(e));
        }

        let session = self
            .start_session(read_half, writer, listener, local_port, remote_port)
            .await;
        inner.session = Some(session);
        inner.state = LinkState::Open;
        self.emit(TunnelEvent::LinkStatus {
            open: true,
            active_connections: 0,
        });
        Ok(())
    }

    /// Spawns the reader, listener and control tasks for one session.
    async fn start_session(
        &self,
        read_half: BoxedRead,
        writer: Arc<TransportWriter>,
        listener: TcpListener,
        local_port: u16,
        remote_port: u16,
    ) -> Arc<Session> {
        let registry = Arc::new(Registry::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CTRL_CHANNEL_CAPACITY);

        let reader_handle = tokio::spawn(run_reader(
            read_half,
            Arc::clone(&registry),
            Arc::clone(&writer),
            ctrl_tx.clone(),
            shutdown_rx.clone(),
        ));
        let listener_handle = tokio::spawn(run_listener(
            listener,
            Arc::clone(&registry),
            Arc::clone(&writer),
            ctrl_tx,
            shutdown_rx,
        ));

        let session = Arc::new(Session {
            local_port,
            remote_port,
            registry,
            writer,
            shutdown,
            tasks: Mutex::new(SessionTasks {
                listener: Some(listener_handle),
                reader: Some(reader_handle),
                control: None,
            }),
        });

        let control_handle = tokio::spawn(run_control(
            ctrl_rx,
            self.events.clone(),
            Arc::clone(&self.inner),
            Arc::clone(&session),
        ));
        session.tasks.lock().await.control = Some(control_handle);
        session
    }

    /// Pushes an event without blocking the state lock on a slow host.
    fn emit(&self, event: TunnelEvent) {
        if self.events.try_send(event).is_err() {
            warn!("event channel full or closed, lifecycle event dropped");
        }
    }
}

// ── Session teardown helpers ──────────────────────────────────────────────────

async fn bind_listener(local_port: u16) -> Result<TcpListener, TunnelError> {
    // Loopback only: the tunnel forwards for processes on this machine.
    TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(|source| TunnelError::Bind {
            port: local_port,
            source,
        })
}

/// Stops a session's tasks and connections in a fixed order.  With
/// `announce` set, a best-effort TERMINATE tells the peer the tunnel is
/// going away for good.
async fn shutdown_session(session: &Session, announce: bool) {
    let _ = session.shutdown.send(true);

    for (id, handle) in session.registry.drain().await {
        debug!(id, "connection dropped at tunnel close");
        handle.stop.notify_one();
    }

    if announce {
        let frame = Frame::terminate();
        let terminate = session.writer.write_frame(&frame);
        if tokio::time::timeout(TERMINATE_TIMEOUT, terminate).await.is_err() {
            debug!("TERMINATE announcement timed out");
        }
    }

    stop_tasks(session).await;
}

/// Joins the listener and reader, dropping the read half.  The control
/// task is detached rather than joined: it exits on its own once every
/// control sender is gone, and teardown may be running on it.
async fn stop_tasks(session: &Session) {
    let (listener_handle, reader_handle, _control_handle) = take_tasks(session).await;
    join_or_abort(listener_handle, LISTENER_JOIN_TIMEOUT).await;
    join_reader(reader_handle).await;
}

async fn take_tasks(
    session: &Session,
) -> (
    Option<JoinHandle<()>>,
    Option<JoinHandle<BoxedRead>>,
    Option<JoinHandle<()>>,
) {
    let mut tasks = session.tasks.lock().await;
    (
        tasks.listener.take(),
        tasks.reader.take(),
        tasks.control.take(),
    )
}

async fn join_or_abort(handle: Option<JoinHandle<()>>, limit: Duration) {
    let Some(mut handle) = handle else { return };
    if tokio::time::timeout(limit, &mut handle).await.is_err() {
        handle.abort();
    }
}

/// Waits for the reader task to return the transport's read half; aborts
/// and returns `None` if it does not stop in time.
async fn join_reader(handle: Option<JoinHandle<BoxedRead>>) -> Option<BoxedRead> {
    let mut handle = handle?;
    match tokio::time::timeout(READER_JOIN_TIMEOUT, &mut handle).await {
        Ok(Ok(read_half)) => Some(read_half),
        Ok(Err(_)) => None,
        Err(_) => {
            handle.abort();
            None
        }
    }
}

/// Forwards task reports to the host and triggers teardown on fatal ones.
///
/// The session identity check makes a stale control task (left over from a
/// rebind) harmless: it can only tear down the session it was spawned for.
async fn run_control(
    mut ctrl_rx: mpsc::Receiver<ControlMsg>,
    events: mpsc::Sender<TunnelEvent>,
    inner: Arc<Mutex<Inner>>,
    session: Arc<Session>,
) {
    while let Some(msg) = ctrl_rx.recv().await {
        match msg {
            ControlMsg::ConnectionCount(n) => {
                let _ = events.send(TunnelEvent::ConnectionCount(n)).await;
            }
            ControlMsg::TransportFailed(reason) => {
                error!(%reason, "transport failed, closing tunnel");
                let _ = events.send(TunnelEvent::Error(reason)).await;
                // The write path is as dead as the read path; no farewell.
                teardown_if_current(&inner, &events, &session, false).await;
                return;
            }
            ControlMsg::PeerTerminated => {
                info!("peer terminated the tunnel");
                // The transport still writes; acknowledge with TERMINATE.
                teardown_if_current(&inner, &events, &session, true).await;
                return;
            }
        }
    }
}

/// Tears the tunnel down if `session` is still the live one.  `announce`
/// controls the best-effort TERMINATE: set when the write path is still
/// viable, clear when the transport itself failed.
async fn teardown_if_current(
    inner: &Mutex<Inner>,
    events: &mpsc::Sender<TunnelEvent>,
    session: &Arc<Session>,
    announce: bool,
) {
    let mut inner = inner.lock().await;
    let is_current = inner
        .session
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, session));
    if !is_current {
        debug!("stale control task skipped teardown");
        return;
    }
    inner.session = None;
    inner.state = LinkState::Closing;

    shutdown_session(session, announce).await;

    inner.state = LinkState::Closed;
    drop(inner);

    let _ = events
        .send(TunnelEvent::LinkStatus {
            open: false,
            active_connections: 0,
        })
        .await;
    let _ = events.send(TunnelEvent::Closed).await;
}
