//! # Utility Modules
//!
//! Supporting utilities shared by the connection, server and client layers.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup driven by [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Thread-safe connection and traffic counters
//! - **Timeout**: Timeout constants and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
