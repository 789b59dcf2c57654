//! Reactor runtime.
//!
//! One thread runs the [`Reactor`]: it owns the listener and the readiness
//! set, accepts connections, and turns connection readiness into work items.
//! A fixed [`WorkerPool`] performs all connection I/O.
//!
//! - `token`: Token namespace and notification classification
//! - `connection`: Connection handles, exclusive dispatch, registry
//! - `pool`: Fixed-size worker pool over a shared queue
//! - `handler`: Per-dispatch read/acknowledge routine
//! - `reactor`: The accept/dispatch loop

pub mod pool;
pub mod token;

#[cfg(unix)]
pub mod connection;
#[cfg(unix)]
pub mod handler;
#[cfg(unix)]
pub mod reactor;

#[cfg(unix)]
pub use connection::{Connection, ConnectionRegistry, DispatchState, DispatchToken};
pub use pool::WorkerPool;
#[cfg(unix)]
pub use reactor::{Reactor, ShutdownHandle, Stats, WorkItem};

use crate::config::Config;

/// Run the server until the reactor stops.
#[cfg(unix)]
pub fn run(config: Config) -> std::io::Result<()> {
    let mut reactor = Reactor::initialize(&config)?;
    reactor.run()
}

#[cfg(not(unix))]
pub fn run(_config: Config) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "Unsupported platform: only Unix-like systems are supported",
    ))
}
