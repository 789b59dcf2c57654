//! mio reactor implementation.
//!
//! Readiness-based model: one thread owns the listener and the poll registry,
//! blocks in `poll`, accepts new connections inline, and hands every
//! connection readiness event to the worker pool. It never reads from or
//! writes to a connection itself.
//!
//! Each `poll` call refills the events buffer from scratch, so a harvested
//! notification is consumed exactly once and never redelivered on the next
//! wake. mio registrations are edge-triggered: a connection only signals
//! again after a worker has drained it to `WouldBlock`.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::handler::{self, Notice, Notifier};
use crate::runtime::pool::WorkerPool;
use crate::runtime::token::{self, Source, LISTENER_TOKEN, WAKER_TOKEN};
use crossbeam_channel::Receiver;
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Waker};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Poll timeout while a stalled accept has connections left in the backlog.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Unit of work handed to the pool: a handle to one ready connection.
pub struct WorkItem {
    pub connection: Arc<Connection>,
}

/// Counters shared between the reactor and its observers.
#[derive(Debug, Default)]
pub struct Stats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    closed: AtomicU64,
}

impl Stats {
    /// Connections accepted and registered.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections dropped because the connection limit was reached.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Work items submitted to the pool.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Connections deregistered after closing.
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake reactor for shutdown");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Single-threaded accept/dispatch loop.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    pool: WorkerPool<WorkItem>,
    notices: Receiver<Notice>,
    shutdown: ShutdownHandle,
    stats: Arc<Stats>,
    /// Set when accepting stopped on an error instead of `WouldBlock`.
    accept_pending: bool,
}

impl Reactor {
    /// Bind the listener, create the readiness set, and start the workers.
    ///
    /// Any failure here is a setup failure and is returned unretried.
    pub fn initialize(config: &Config) -> io::Result<Self> {
        let addr = resolve(&config.listen_addr())?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr, config.backlog)?);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (notice_tx, notices) = crossbeam_channel::unbounded();
        let notifier = Notifier::new(notice_tx, Arc::clone(&waker));

        let workers = config.worker_count();
        let pool = WorkerPool::new(
            workers,
            config.queue_capacity,
            config.buffer_size,
            move |item: WorkItem, buf: &mut [u8]| handler::service(&item.connection, buf, &notifier),
        )?;

        let connections = ConnectionRegistry::new(config.max_connections);
        info!(
            addr = %local_addr,
            workers,
            max_connections = connections.capacity(),
            buffer_size = config.buffer_size,
            queue_capacity = config.queue_capacity,
            "Reactor initialized"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            local_addr,
            connections,
            pool,
            notices,
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker,
            },
            stats: Arc::new(Stats::default()),
            accept_pending: false,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Wait for readiness and dispatch until shut down.
    ///
    /// Returns `Ok(())` after a shutdown request and an error if polling
    /// fails or the worker pool is gone.
    pub fn run(&mut self) -> io::Result<()> {
        info!(addr = %self.local_addr, "Reactor running");

        while !self.shutdown.is_requested() {
            let timeout = self.accept_pending.then_some(ACCEPT_RETRY);
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    return Err(e);
                }
            }

            // The listener won't signal again for connections already queued.
            if self.accept_pending {
                self.accept_pending = !accept_connections(
                    &self.listener,
                    self.poll.registry(),
                    &mut self.connections,
                    &self.stats,
                );
            }

            if self.events.is_empty() {
                trace!("Woke without events");
                continue;
            }

            for event in self.events.iter() {
                match token::classify(event.token()) {
                    Source::Listener => {
                        self.accept_pending = !accept_connections(
                            &self.listener,
                            self.poll.registry(),
                            &mut self.connections,
                            &self.stats,
                        )
                    }
                    Source::Waker => process_notices(
                        &self.notices,
                        self.poll.registry(),
                        &mut self.connections,
                        &self.stats,
                    ),
                    Source::Connection { conn_id } => {
                        dispatch(conn_id, &self.connections, &self.pool, &self.stats)?
                    }
                }
            }
        }

        info!(
            accepted = self.stats.accepted(),
            rejected = self.stats.rejected(),
            dispatched = self.stats.dispatched(),
            closed = self.stats.closed(),
            open = self.connections.len(),
            "Reactor stopped"
        );
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if self.connections.is_empty() {
            return;
        }
        for conn in self.connections.drain() {
            let fd = conn.raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }
}

/// Accept every queued connection.
///
/// Returns `false` if accepting stopped on an error (e.g. `EMFILE`) before the
/// backlog was drained.
fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    stats: &Stats,
) -> bool {
    // Edge-triggered: take everything pending or the next arrival won't signal.
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let conn = match connections.insert(stream, peer_addr) {
                    Some(conn) => conn,
                    None => {
                        stats.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(peer = %peer_addr, "Connection limit reached");
                        continue;
                    }
                };

                let fd = conn.raw_fd();
                if let Err(e) = registry.register(
                    &mut SourceFd(&fd),
                    token::connection_token(conn.id()),
                    Interest::READABLE,
                ) {
                    error!(peer = %peer_addr, error = %e, "Failed to register connection");
                    connections.remove(conn.id());
                    continue;
                }

                stats.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(conn_id = conn.id(), peer = %peer_addr, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            // The peer gave up while queued; others may still be waiting.
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue
            }
            Err(e) => {
                error!(error = %e, "Accept error, retrying on next wake");
                return false;
            }
        }
    }
}

fn dispatch(
    conn_id: usize,
    connections: &ConnectionRegistry,
    pool: &WorkerPool<WorkItem>,
    stats: &Stats,
) -> io::Result<()> {
    let Some(conn) = connections.get(conn_id) else {
        warn!(conn_id, "Readiness for unknown connection");
        return Ok(());
    };

    // A worker already owns it; it will run another pass for this event.
    if !conn.dispatch().schedule() {
        trace!(conn_id, "Connection busy, coalesced readiness");
        return Ok(());
    }

    stats.dispatched.fetch_add(1, Ordering::Relaxed);
    pool.submit(WorkItem {
        connection: Arc::clone(conn),
    })
}

fn process_notices(
    notices: &Receiver<Notice>,
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    stats: &Stats,
) {
    for notice in notices.try_iter() {
        match notice {
            Notice::Closed(conn_id) => close_connection(registry, connections, stats, conn_id),
            Notice::Rearm(conn_id) => {
                let Some(conn) = connections.get(conn_id) else {
                    continue;
                };
                let fd = conn.raw_fd();
                if let Err(e) = registry.reregister(
                    &mut SourceFd(&fd),
                    token::connection_token(conn_id),
                    conn.interest(),
                ) {
                    warn!(conn_id, error = %e, "Failed to rearm connection");
                }
            }
        }
    }
}

fn close_connection(
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    stats: &Stats,
    conn_id: usize,
) {
    if let Some(conn) = connections.remove(conn_id) {
        let fd = conn.raw_fd();
        let _ = registry.deregister(&mut SourceFd(&fd));
        stats.closed.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id, peer = %conn.peer(), "Connection closed");
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for '{listen}'"),
        )
    })
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ack::ACK_MESSAGE;
    use crate::runtime::connection::tests::socket_pair;
    use crate::runtime::connection::DispatchState;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Instant;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            ..Config::default()
        }
    }

    #[test]
    fn test_initialize_binds_ephemeral_port() {
        let reactor = Reactor::initialize(&test_config()).unwrap();
        assert_eq!(reactor.local_addr().ip().to_string(), "127.0.0.1");
        assert_ne!(reactor.local_addr().port(), 0);
        assert_eq!(reactor.connection_count(), 0);
    }

    #[test]
    fn test_initialize_fails_on_port_in_use() {
        let first = Reactor::initialize(&test_config()).unwrap();
        let config = Config {
            port: first.local_addr().port(),
            ..test_config()
        };
        // SO_REUSEADDR does not allow two live listeners on one port.
        assert!(Reactor::initialize(&config).is_err());
    }

    #[test]
    fn test_run_serves_and_stops() {
        let mut reactor = Reactor::initialize(&test_config()).unwrap();
        let addr = reactor.local_addr();
        let shutdown = reactor.shutdown_handle();
        let stats = reactor.stats();

        let server = thread::spawn(move || reactor.run());

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"hello").unwrap();
        let mut reply = vec![0u8; ACK_MESSAGE.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, ACK_MESSAGE.as_bytes());

        shutdown.shutdown();
        assert!(shutdown.is_requested());
        server.join().unwrap().unwrap();

        assert_eq!(stats.accepted(), 1);
        assert!(stats.dispatched() >= 1);
    }

    fn idle_pool() -> WorkerPool<WorkItem> {
        WorkerPool::new(1, 0, 8, |_: WorkItem, _: &mut [u8]| {}).unwrap()
    }

    #[test]
    fn test_dispatch_ignores_unknown_connection() {
        let registry = ConnectionRegistry::new(4);
        let pool = idle_pool();
        let stats = Stats::default();

        assert!(dispatch(99, &registry, &pool, &stats).is_ok());
        assert_eq!(stats.dispatched(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_dispatch_skips_closed_connection() {
        let mut registry = ConnectionRegistry::new(4);
        let pool = idle_pool();
        let stats = Stats::default();
        let (stream, peer, _client) = socket_pair();
        let conn = registry.insert(stream, peer).unwrap();

        assert!(conn.dispatch().close());
        assert!(dispatch(conn.id(), &registry, &pool, &stats).is_ok());
        assert_eq!(stats.dispatched(), 0);
        assert_eq!(conn.dispatch().state(), DispatchState::Closed);
        assert!(!conn.dispatch().schedule());
    }

    #[test]
    fn test_dispatch_coalesces_while_running() {
        let mut registry = ConnectionRegistry::new(4);
        let pool = idle_pool();
        let stats = Stats::default();
        let (stream, peer, _client) = socket_pair();
        let conn = registry.insert(stream, peer).unwrap();

        assert!(conn.dispatch().schedule());
        assert!(dispatch(conn.id(), &registry, &pool, &stats).is_ok());
        assert_eq!(stats.dispatched(), 0);
        assert_eq!(conn.dispatch().state(), DispatchState::RunningNotified);
    }

    #[test]
    fn test_stalled_accept_is_retried_without_new_event() {
        let mut reactor = Reactor::initialize(&test_config()).unwrap();
        let addr = reactor.local_addr();
        let _client = TcpStream::connect(addr).unwrap();

        // Consume the listener's edge without accepting, as a failed accept does.
        let mut events = Events::with_capacity(8);
        reactor
            .poll
            .poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(events.iter().any(|e| e.token() == LISTENER_TOKEN));
        reactor.accept_pending = true;

        let shutdown = reactor.shutdown_handle();
        let stats = reactor.stats();
        let server = thread::spawn(move || reactor.run());

        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.accepted() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.shutdown();
        server.join().unwrap().unwrap();
        assert_eq!(stats.accepted(), 1);
    }
}
