//! Token namespace for the readiness set.
//!
//! Every registered source gets a unique mio token. Connection tokens are
//! slab indices handed out by the connection registry; the listener and the
//! waker use reserved values at the top of the range so they can never
//! collide with a slab slot.

use mio::Token;

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token of the waker used by workers and the shutdown handle.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// What a readiness notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Accept readiness on the listening socket.
    Listener,
    /// The reactor was woken from another thread.
    Waker,
    /// Readiness on an accepted connection.
    Connection {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
}

/// Classify a notification by its token.
pub fn classify(token: Token) -> Source {
    match token {
        LISTENER_TOKEN => Source::Listener,
        WAKER_TOKEN => Source::Waker,
        Token(conn_id) => Source::Connection { conn_id },
    }
}

/// Token under which a connection is registered.
pub fn connection_token(conn_id: usize) -> Token {
    debug_assert!(conn_id < WAKER_TOKEN.0, "connection id overlaps reserved tokens");
    Token(conn_id)
}
