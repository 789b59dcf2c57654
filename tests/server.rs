//! End-to-end tests against a live reactor on a loopback port.

use ack_server::config::Config;
use ack_server::protocols::ack::ACK_MESSAGE;
use ack_server::runtime::{Reactor, ShutdownHandle, Stats};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    stats: Arc<Stats>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl TestServer {
    fn start(workers: usize, max_connections: usize) -> Self {
        Self::start_with(Config {
            workers,
            max_connections,
            ..Config::default()
        })
    }

    /// Start on an ephemeral loopback port with otherwise custom settings.
    fn start_with(config: Config) -> Self {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..config
        };
        let mut reactor = Reactor::initialize(&config).unwrap();
        let addr = reactor.local_addr();
        let shutdown = reactor.shutdown_handle();
        let stats = reactor.stats();
        let thread = thread::spawn(move || reactor.run());

        Self {
            addr,
            shutdown,
            stats,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Stop the reactor and return the result of `run`.
    fn stop(mut self) -> io::Result<()> {
        self.shutdown.shutdown();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.shutdown();
            let _ = thread.join();
        }
    }
}

fn read_ack(stream: &mut TcpStream) {
    let mut reply = vec![0u8; ACK_MESSAGE.len()];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, ACK_MESSAGE.as_bytes());
}

fn assert_silent(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut scratch = [0u8; 64];
    match stream.read(&mut scratch) {
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
        other => panic!("expected no further output, got {other:?}"),
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_ping_then_disconnect() {
    let server = TestServer::start(1, 16);
    let mut client = server.connect();

    client.write_all(b"ping").unwrap();
    read_ack(&mut client);
    client.shutdown(Shutdown::Write).unwrap();

    // Exactly one acknowledgment, then the server closes its end.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    wait_until(|| server.stats.closed() == 1);
    assert_eq!(server.stats.accepted(), 1);
    server.stop().unwrap();
}

#[test]
fn test_every_message_is_acknowledged() {
    let server = TestServer::start(2, 16);
    let mut client = server.connect();

    for message in [&b"first"[..], b"second", b"third"] {
        client.write_all(message).unwrap();
        read_ack(&mut client);
    }
    assert_silent(&mut client);
}

#[test]
fn test_concurrent_clients_are_isolated() {
    let server = TestServer::start(2, 16);
    let mut a = server.connect();
    let mut b = server.connect();

    a.write_all(b"X").unwrap();
    b.write_all(b"Y").unwrap();

    read_ack(&mut a);
    read_ack(&mut b);
    assert_silent(&mut a);
    assert_silent(&mut b);
}

#[test]
fn test_reset_client_does_not_stop_server() {
    let server = TestServer::start(1, 16);

    let victim = server.connect();
    (&victim).write_all(b"doomed").unwrap();
    wait_until(|| server.stats.accepted() == 1);
    socket2::SockRef::from(&victim)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    // Zero linger turns close into a reset.
    drop(victim);

    wait_until(|| server.stats.closed() == 1);

    let mut survivor = server.connect();
    survivor.write_all(b"still there?").unwrap();
    read_ack(&mut survivor);
    server.stop().unwrap();
}

#[test]
fn test_saturated_pool_serves_everyone() {
    let server = TestServer::start(2, 256);
    let clients = 32;

    let handles: Vec<_> = (0..clients)
        .map(|i| {
            let mut client = server.connect();
            thread::spawn(move || {
                client.write_all(format!("client {i}").as_bytes()).unwrap();
                read_ack(&mut client);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(server.stats.accepted(), clients);
    assert!(server.stats.dispatched() >= clients);
}

#[test]
fn test_one_registration_per_connection() {
    let server = TestServer::start(1, 16);
    let mut clients: Vec<_> = (0..5).map(|_| server.connect()).collect();

    for client in &mut clients {
        client.write_all(b"hi").unwrap();
        read_ack(client);
    }

    assert_eq!(server.stats.accepted(), 5);
    assert_eq!(server.stats.rejected(), 0);
}

#[test]
fn test_connection_limit_rejects_extra_clients() {
    let server = TestServer::start(1, 1);

    let mut admitted = server.connect();
    admitted.write_all(b"in").unwrap();
    read_ack(&mut admitted);

    let mut extra = server.connect();
    wait_until(|| server.stats.rejected() == 1);
    let _ = extra.write_all(b"out");
    let mut scratch = [0u8; 64];
    assert!(!matches!(extra.read(&mut scratch), Ok(n) if n > 0));

    // The admitted client is unaffected.
    admitted.write_all(b"again").unwrap();
    read_ack(&mut admitted);
}

#[test]
fn test_slow_reader_gets_every_ack() {
    // One byte per chunk: the acks outgrow the input 25 to 1 and fill the
    // socket buffers long before the client is done writing.
    let server = TestServer::start_with(Config {
        workers: 2,
        max_connections: 16,
        buffer_size: 1,
        ..Config::default()
    });
    let mut reader = server.connect();
    reader
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut writer = reader.try_clone().unwrap();

    let sent = 200_000;
    let writing = thread::spawn(move || {
        writer.write_all(&vec![b'x'; sent]).unwrap();
        writer
    });

    let expected = sent * ACK_MESSAGE.len();
    let ack = ACK_MESSAGE.as_bytes();
    let mut received = 0;
    let mut buf = [0u8; 64 * 1024];
    while received < expected {
        let n = reader.read(&mut buf).unwrap();
        assert!(n > 0, "server closed after {received} of {expected} bytes");
        for (i, byte) in buf[..n].iter().enumerate() {
            assert_eq!(*byte, ack[(received + i) % ack.len()]);
        }
        received += n;
    }
    assert_eq!(received, expected);

    let _writer = writing.join().unwrap();
    assert_silent(&mut reader);
}
