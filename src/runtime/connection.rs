//! Connection handles and the reactor-owned connection registry.
//!
//! A connection's socket is shared between the reactor (which registers it
//! with the poller) and whichever worker is currently servicing it. The
//! [`DispatchToken`] guarantees that at most one worker services a given
//! connection at a time.

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const RUNNING_NOTIFIED: u8 = 2;
const CLOSED: u8 = 3;

/// Observable state of a [`DispatchToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Registered and waiting for readiness.
    Idle,
    /// A worker owns the connection.
    Running,
    /// A worker owns the connection and more readiness arrived meanwhile.
    RunningNotified,
    /// Terminal.
    Closed,
}

/// Per-connection exclusive-execution token.
///
/// The reactor calls [`schedule`](Self::schedule) for every readiness
/// notification and submits work only when it returns `true`. The worker
/// calls [`finish`](Self::finish) when it has drained the socket; if readiness
/// arrived while it was running, `finish` returns `false` and the worker must
/// drain again before the token is released.
#[derive(Debug)]
pub struct DispatchToken {
    state: AtomicU8,
}

impl Default for DispatchToken {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchToken {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Record a readiness notification.
    ///
    /// Returns `true` if the caller acquired the token and must dispatch.
    pub fn schedule(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => RUNNING_NOTIFIED,
                _ => return false,
            };
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next == RUNNING,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release the token after a drain pass.
    ///
    /// Returns `false` if a notification was recorded during the pass; the
    /// token stays held and the caller must run another pass.
    pub fn finish(&self) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            // A failed exchange here can only mean the connection was closed.
            Err(RUNNING_NOTIFIED) => self
                .state
                .compare_exchange(
                    RUNNING_NOTIFIED,
                    RUNNING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err(),
            Err(_) => true,
        }
    }

    /// Move to the terminal state. Returns `true` on the first call.
    pub fn close(&self) -> bool {
        self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }

    pub fn state(&self) -> DispatchState {
        match self.state.load(Ordering::Acquire) {
            IDLE => DispatchState::Idle,
            RUNNING => DispatchState::Running,
            RUNNING_NOTIFIED => DispatchState::RunningNotified,
            _ => DispatchState::Closed,
        }
    }
}

/// One accepted client connection.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    stream: TcpStream,
    peer: SocketAddr,
    dispatch: DispatchToken,
    /// Acknowledgments not yet accepted by the socket.
    outbox: Mutex<BytesMut>,
    /// Whether the worker asked for write readiness.
    wants_write: AtomicBool,
}

impl Connection {
    fn new(id: usize, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            dispatch: DispatchToken::new(),
            outbox: Mutex::new(BytesMut::new()),
            wants_write: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn dispatch(&self) -> &DispatchToken {
        &self.dispatch
    }

    /// Pending output. Only the worker holding the dispatch token touches it.
    pub fn outbox(&self) -> MutexGuard<'_, BytesMut> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record whether write readiness is needed.
    ///
    /// Returns `true` if this changed the connection's desired interest.
    pub fn set_wants_write(&self, wants_write: bool) -> bool {
        self.wants_write.swap(wants_write, Ordering::AcqRel) != wants_write
    }

    /// Interest the reactor should register for this connection.
    pub fn interest(&self) -> Interest {
        if self.wants_write.load(Ordering::Acquire) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }
}

/// Registry of live connections using slab allocation.
///
/// Owned and mutated only by the reactor thread.
pub struct ConnectionRegistry {
    connections: Slab<Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert an accepted stream.
    ///
    /// Returns `None` (dropping the stream) if the registry is at capacity.
    pub fn insert(&mut self, stream: TcpStream, peer: SocketAddr) -> Option<Arc<Connection>> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let conn = Arc::new(Connection::new(entry.key(), stream, peer));
        entry.insert(Arc::clone(&conn));
        Some(conn)
    }

    pub fn get(&self, id: usize) -> Option<&Arc<Connection>> {
        self.connections.get(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Arc<Connection>> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Arc<Connection>> + '_ {
        self.connections.drain()
    }
}
