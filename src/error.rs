//! # Error Types
//!
//! Error handling for framing, connections, servers and discovery.
//!
//! ## Error Categories
//! - **Transport Errors**: resolution, connect and socket creation failures.
//!   These are reported through observer callbacks when they happen on a live
//!   connection, and returned directly when they happen in a synchronous call
//!   such as [`ConnectionServer::bind`](crate::service::server::ConnectionServer::bind).
//! - **Caller Errors**: sending on a closed link, targeting an unknown
//!   connection, dialling twice, oversized payloads. Always returned
//!   synchronously to the caller.
//! - **Discovery Errors**: failures reported by the discovery collaborator.
//!
//! ## Example Usage
//! ```rust
//! use peerlink::core::frame;
//! use peerlink::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn frame_greeting() -> Result<usize> {
//!     let bytes = frame::encode(b"hello")?;
//!     Ok(bytes.len())
//! }
//!
//! match frame_greeting() {
//!     Ok(len) => info!(len, "Framed greeting"),
//!     Err(e) => error!(error = %e, "Could not frame greeting"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::transport::connection::ConnectionId;

/// Static error messages shared by several error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Discovery errors
    pub const ERR_DUPLICATE_INSTANCE: &str = "Service instance already advertised";
    pub const ERR_UNKNOWN_INSTANCE: &str = "Service instance not found";
    pub const ERR_UNKNOWN_HANDLE: &str = "Service handle not registered";

    /// Server errors
    pub const ERR_NO_LISTENER: &str = "Could not bind an IPv4 or IPv6 listener";
}

/// Primary error type for every peerlink operation
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Could not resolve peer: {0}")]
    ResolveFailed(String),

    #[error("Could not connect to peer: {0}")]
    ConnectFailed(String),

    #[error("Could not create listening socket: {0}")]
    SocketCreateFailed(String),

    #[error("Frame too large: {0} bytes does not fit a 32-bit length")]
    FrameTooLarge(usize),

    #[error("Incoming frame of {0} bytes exceeds the configured limit")]
    OversizedFrame(usize),

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("A connection attempt is already active")]
    AlreadyConnecting,

    #[error("No found service at index {0}")]
    InvalidServiceIndex(usize),

    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    #[error("No discovery collaborator configured")]
    DiscoveryUnavailable,

    #[error("Server has been shut down")]
    ServerShutDown,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error stems from misuse by the caller rather than the network
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge(_)
                | ProtocolError::NotConnected
                | ProtocolError::UnknownConnection(_)
                | ProtocolError::AlreadyConnecting
                | ProtocolError::InvalidServiceIndex(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_classified() {
        assert!(ProtocolError::NotConnected.is_caller_error());
        assert!(ProtocolError::AlreadyConnecting.is_caller_error());
        assert!(ProtocolError::FrameTooLarge(usize::MAX).is_caller_error());
        assert!(!ProtocolError::ConnectFailed("refused".into()).is_caller_error());
        assert!(!ProtocolError::Io(io::Error::other("boom")).is_caller_error());
    }

    #[test]
    fn display_mentions_connection_id() {
        let err = ProtocolError::UnknownConnection(ConnectionId::from_raw(42));
        assert_eq!(err.to_string(), "Unknown connection: conn-42");
    }
}
