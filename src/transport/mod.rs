//! # Transport Layer
//!
//! Byte-stream plumbing beneath the server and client sessions.
//!
//! - [`connection`]: the framed peer connection and its driver task
//! - [`listener`]: listening sockets and dual-stack binding
//! - [`outgoing`]: the write queue with partial-write tracking

pub mod connection;
pub mod listener;
pub mod outgoing;

pub use connection::{
    Connection, ConnectionId, ConnectionObserver, ConnectionState, PeerAddress, PeerDescriptor,
};
pub use listener::{bind_dual_stack, DualStack, Listener, TcpAcceptor};
