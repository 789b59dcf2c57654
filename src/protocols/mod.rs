//! Protocol implementations.
//!
//! - `ack`: Fixed acknowledgment for every received chunk

pub mod ack;
