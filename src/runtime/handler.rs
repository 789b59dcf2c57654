//! Worker-side connection servicing.
//!
//! A dispatched worker drains the socket in chunks of at most the scratch
//! buffer size, queuing one acknowledgment per non-empty chunk, until a read
//! reports `WouldBlock`. While acknowledgments are stuck in the outbox the
//! worker stops reading and asks the reactor for write readiness instead.
//!
//! Workers never touch the poll registry. Closure and interest changes are
//! reported back to the reactor as [`Notice`]s.

use crate::protocols::ack;
use crate::runtime::connection::Connection;
use bytes::{Buf, BytesMut};
use crossbeam_channel::Sender;
use mio::Waker;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Message from a worker to the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The connection is finished; deregister and drop it.
    Closed(usize),
    /// The connection's desired interest changed; re-register it.
    Rearm(usize),
}

/// Channel back to the reactor thread.
#[derive(Clone)]
pub struct Notifier {
    sender: Sender<Notice>,
    waker: Arc<Waker>,
}

impl Notifier {
    pub fn new(sender: Sender<Notice>, waker: Arc<Waker>) -> Self {
        Self { sender, waker }
    }

    /// Queue a notice and wake the reactor.
    pub fn notify(&self, notice: Notice) {
        // The reactor is gone during shutdown; nothing left to tell.
        if self.sender.send(notice).is_err() {
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, ?notice, "Failed to wake reactor");
        }
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Socket has no more data for now and the outbox is empty.
    Drained,
    /// The socket stopped accepting output.
    WriteBlocked,
    /// Peer closed its end.
    PeerClosed,
}

/// Service one dispatch of `conn`.
///
/// The caller must hold the connection's dispatch token. Returns once the
/// token is released or the connection is closed.
pub fn service(conn: &Connection, buf: &mut [u8], notifier: &Notifier) {
    loop {
        match drain(conn, buf) {
            Ok(Progress::PeerClosed) => {
                debug!(conn_id = conn.id(), peer = %conn.peer(), "Peer closed connection");
                close(conn, notifier);
                return;
            }
            Ok(progress) => {
                let wants_write = progress == Progress::WriteBlocked;
                if conn.set_wants_write(wants_write) {
                    trace!(conn_id = conn.id(), wants_write, "Requesting rearm");
                    notifier.notify(Notice::Rearm(conn.id()));
                }
            }
            Err(e) => {
                debug!(conn_id = conn.id(), peer = %conn.peer(), error = %e, "I/O error, closing connection");
                close(conn, notifier);
                return;
            }
        }

        if conn.dispatch().finish() {
            return;
        }
    }
}

fn drain(conn: &Connection, buf: &mut [u8]) -> io::Result<Progress> {
    let mut outbox = conn.outbox();

    if !flush(conn, &mut outbox)? {
        return Ok(Progress::WriteBlocked);
    }

    loop {
        let n = match conn.stream().read(buf) {
            Ok(0) => return Ok(Progress::PeerClosed),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Drained),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let chunk = &buf[..n];
        debug!(
            conn_id = conn.id(),
            peer = %conn.peer(),
            message = %ack::describe(chunk),
            "Received message"
        );

        ack::respond(chunk, &mut outbox);
        if !flush(conn, &mut outbox)? {
            return Ok(Progress::WriteBlocked);
        }
    }
}

/// Write out as much of `outbox` as the socket takes.
///
/// Returns `true` once the outbox is empty.
fn flush(conn: &Connection, outbox: &mut BytesMut) -> io::Result<bool> {
    while !outbox.is_empty() {
        match conn.stream().write(&outbox[..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => outbox.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn close(conn: &Connection, notifier: &Notifier) {
    if conn.dispatch().close() {
        conn.outbox().clear();
        // The fd stays open until the reactor drops its handle.
        let _ = conn.stream().shutdown(Shutdown::Both);
        notifier.notify(Notice::Closed(conn.id()));
    }
}
