//! # Core Framing Components
//!
//! Message framing over an unbounded byte stream.
//!
//! ## Components
//! - **Frame**: pure `encode` / `try_decode` functions, no I/O
//! - **Codec**: Tokio codec adapter used by the connection read path
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian u32)] [Payload(Length)]
//! ```
//!
//! ## Guarantees
//! - A frame is never partially consumed
//! - Zero-length payloads are legal
//! - Announced lengths are checked against a limit before allocation

pub mod codec;
pub mod frame;
