//! Timeout constants and helpers.
//!
//! Resolution and connection attempts carry no built-in timeout. Callers that
//! need bounded latency wrap the wait in [`with_timeout_error`] and call
//! `close()` / `disconnect()` when it elapses.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// General purpose operation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close()` keeps flushing queued frames
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a graceful server shutdown waits for the pool to drain
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the pool to drain
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run `fut`, mapping expiry to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Run `fut`, returning `None` on expiry
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expiry_maps_to_timeout_error() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn inner_error_passes_through() {
        let result: Result<()> =
            with_timeout_error(async { Err(ProtocolError::NotConnected) }, DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(ProtocolError::NotConnected)));
    }

    #[tokio::test]
    async fn with_timeout_returns_value() {
        assert_eq!(with_timeout(async { 7 }, DEFAULT_TIMEOUT).await, Some(7));
    }
}
