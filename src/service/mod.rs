//! # Service Layer
//!
//! The two roles built on top of [`Connection`](crate::transport::connection::Connection):
//!
//! - [`server::ConnectionServer`]: listens on a dual-stack port, pools accepted
//!   connections, publishes itself through a discovery collaborator
//! - [`client::ClientSession`]: browses for a service type and holds a single
//!   outbound connection

pub mod client;
pub mod server;

pub use client::{ClientObserver, ClientSession};
pub use server::{ConnectionServer, ServerObserver};
