//! Node counters
//!
//! Thread-safe metrics collection using atomic types

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared counters for one storage node
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Connection metrics
    active_connections: AtomicUsize,
    connections_accepted: AtomicU64,

    // Fragment transfer metrics
    fragments_stored: AtomicU64,
    fragments_served: AtomicU64,

    // Byte transfer metrics
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,

    protocol_errors: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                active_connections: AtomicUsize::new(0),
                connections_accepted: AtomicU64::new(0),
                fragments_stored: AtomicU64::new(0),
                fragments_served: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                protocol_errors: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Connection metrics

    pub fn connection_opened(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn connections_accepted(&self) -> u64 {
        self.inner.connections_accepted.load(Ordering::Relaxed)
    }

    // Fragment transfer metrics

    pub fn fragment_stored(&self, size: usize) {
        self.inner.fragments_stored.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn fragment_served(&self, size: usize) {
        self.inner.fragments_served.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn fragments_stored(&self) -> u64 {
        self.inner.fragments_stored.load(Ordering::Relaxed)
    }

    pub fn fragments_served(&self) -> u64 {
        self.inner.fragments_served.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn protocol_error(&self) {
        self.inner.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_errors(&self) -> u64 {
        self.inner.protocol_errors.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            active_connections: self.active_connections(),
            connections_accepted: self.connections_accepted(),
            fragments_stored: self.fragments_stored(),
            fragments_served: self.fragments_served(),
            bytes_received: self.bytes_received(),
            bytes_sent: self.bytes_sent(),
            protocol_errors: self.protocol_errors(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub active_connections: usize,
    pub connections_accepted: u64,
    pub fragments_stored: u64,
    pub fragments_served: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub protocol_errors: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime={}s connections={} (active {}) stored={} ({} bytes) served={} ({} bytes) protocol_errors={}",
            self.uptime_seconds,
            self.connections_accepted,
            self.active_connections,
            self.fragments_stored,
            self.bytes_received,
            self.fragments_served,
            self.bytes_sent,
            self.protocol_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connections() {
        let metrics = Metrics::new();
        assert_eq!(metrics.active_connections(), 0);

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections(), 2);
        assert_eq!(metrics.connections_accepted(), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections(), 1);
        assert_eq!(metrics.connections_accepted(), 2); // Doesn't decrease
    }

    #[test]
    fn test_fragment_transfers() {
        let metrics = Metrics::new();

        metrics.fragment_stored(100);
        metrics.fragment_stored(28);
        assert_eq!(metrics.fragments_stored(), 2);
        assert_eq!(metrics.bytes_received(), 128);

        metrics.fragment_served(50);
        assert_eq!(metrics.fragments_served(), 1);
        assert_eq!(metrics.bytes_sent(), 50);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let handle = metrics.clone();
        handle.protocol_error();
        assert_eq!(metrics.protocol_errors(), 1);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.fragment_stored(10);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fragments_stored, 1);

        let text = snapshot.to_string();
        assert!(text.contains("connections=1 (active 1)"));
        assert!(text.contains("stored=1 (10 bytes)"));
        assert!(text.contains("protocol_errors=0"));
    }
}
