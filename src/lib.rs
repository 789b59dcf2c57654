//! ack-server: a readiness-driven TCP acknowledgment server.
//!
//! A single reactor thread multiplexes the listening socket and all client
//! connections with mio (epoll on Linux, kqueue on macOS). Readable
//! connections are handed to a fixed worker pool, which answers every
//! received chunk with a constant acknowledgment.

pub mod config;
pub mod protocols;
pub mod runtime;
