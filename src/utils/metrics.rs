//! Observability and Metrics
//!
//! Atomic counters for connection lifecycle and traffic. Each server or client
//! session owns one [`Metrics`] and shares it with its connections via `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for one server or client session
#[derive(Debug)]
pub struct Metrics {
    /// Connections that reached `Open`
    pub connections_total: AtomicU64,
    /// Connections currently `Open` or `Closing`
    pub connections_active: AtomicU64,
    /// Resolve or connect failures
    pub connection_failures: AtomicU64,
    /// Stream errors on established connections
    pub connection_errors: AtomicU64,
    /// Accepted sockets dropped because the pool was full
    pub connections_rejected: AtomicU64,
    /// Frames written
    pub frames_sent: AtomicU64,
    /// Frames decoded
    pub frames_received: AtomicU64,
    /// Bytes written, prefixes included
    pub bytes_sent: AtomicU64,
    /// Payload bytes decoded
    pub bytes_received: AtomicU64,
    /// Broadcast calls
    pub broadcasts: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fully written frame of `byte_count` wire bytes
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a decoded frame carrying `byte_count` payload bytes
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connection_failures = snapshot.connection_failures,
            connection_errors = snapshot.connection_errors,
            connections_rejected = snapshot.connections_rejected,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            broadcasts = snapshot.broadcasts,
            uptime_seconds = snapshot.uptime_seconds,
            "Peer link metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connection_failures: u64,
    pub connection_errors: u64,
    pub connections_rejected: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub broadcasts: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_tracks_open_and_close() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
    }

    #[test]
    fn traffic_counters_accumulate() {
        let metrics = Metrics::default();
        metrics.frame_sent(8);
        metrics.frame_sent(4);
        metrics.frame_received(3);

        let snap = metrics.snapshot();
        assert_eq!((snap.frames_sent, snap.bytes_sent), (2, 12));
        assert_eq!((snap.frames_received, snap.bytes_received), (1, 3));
    }
}
