//! # peerlink
//!
//! Advertise a typed service on the local network, discover peers offering it,
//! and exchange length-prefixed messages with them over TCP.
//!
//! ## Layers
//! - **core**: pure frame encoding/decoding and the tokio codec adapter
//! - **transport**: the framed [`Connection`](transport::connection::Connection)
//!   state machine and the dual-stack listener capability
//! - **service**: the multi-peer [`ConnectionServer`](service::server::ConnectionServer)
//!   and the single-peer [`ClientSession`](service::client::ClientSession)
//! - **discovery**: the discovery collaborator trait and an in-process registry
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian)] [Payload(Length)]
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerlink::config::NetworkConfig;
//! use peerlink::service::client::{ClientObserver, ClientSession};
//! use peerlink::service::server::{ConnectionServer, ServerObserver};
//! use peerlink::transport::connection::PeerDescriptor;
//!
//! struct Quiet;
//! impl ServerObserver for Quiet {}
//! impl ClientObserver for Quiet {}
//!
//! # async fn run() -> peerlink::error::Result<()> {
//! let config = NetworkConfig::default();
//! let observer = Arc::new(Quiet);
//!
//! let server = ConnectionServer::bind(&config, Arc::downgrade(&observer) as _).await?;
//! let client = ClientSession::new(&config, None, Arc::downgrade(&observer) as _);
//! client.connect(PeerDescriptor::host("127.0.0.1", server.port()))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod discovery;
pub mod error;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::frame::Frame;
pub use crate::error::{ProtocolError, Result};
pub use crate::transport::connection::{Connection, ConnectionId, ConnectionState};
pub use crate::transport::connection::{ConnectionObserver, PeerDescriptor};
pub use crate::service::{ClientObserver, ClientSession, ConnectionServer, ServerObserver};
pub use crate::discovery::{Discovery, LocalDiscovery};
