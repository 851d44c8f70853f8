//! Metrics collection for the transport layer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transport metrics collector
#[derive(Debug, Default)]
pub struct TransportMetrics {
    // Write path
    pub sends_dispatched: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub writes_absorbed: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub flush_timeouts: AtomicU64,

    // Lifecycle
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
}

impl TransportMetrics {
    /// Record a payload handed to a channel's execution context
    pub fn record_send(&self, byte_count: u64) {
        self.sends_dispatched.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a write absorbed into the batch buffer without transmission
    pub fn record_write_absorbed(&self) {
        self.writes_absorbed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch buffer handed off for transmission
    pub fn record_batch_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flush wait that elapsed without completion
    pub fn record_flush_timeout(&self) {
        self.flush_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new connection
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Average payload size handed to the transport, in bytes
    pub fn average_send_size(&self) -> f64 {
        let sends = self.sends_dispatched.load(Ordering::Relaxed);
        let bytes = self.bytes_sent.load(Ordering::Relaxed);

        if sends == 0 {
            0.0
        } else {
            bytes as f64 / sends as f64
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sends_dispatched: self.sends_dispatched.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            writes_absorbed: self.writes_absorbed.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            flush_timeouts: self.flush_timeouts.load(Ordering::Relaxed),
            average_send_size: self.average_send_size(),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of transport metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub sends_dispatched: u64,
    pub bytes_sent: u64,
    pub writes_absorbed: u64,
    pub batches_flushed: u64,
    pub flush_timeouts: u64,
    pub average_send_size: f64,
    pub connections_created: u64,
    pub connections_closed: u64,
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<TransportMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(TransportMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<TransportMetrics> {
    GLOBAL_METRICS.clone()
}
