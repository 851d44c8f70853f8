//! Pooled buffer allocation for the transport layer
//!
//! Connections draw their batch and scratch buffers from a lock-free pool
//! so steady-state writing does not allocate. Buffers above the pooled
//! capacity are allocated fresh and never retained.

use bytes::BytesMut;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free pool of reusable write buffers
pub struct BufferPool {
    buffers: SegQueue<BytesMut>,
    buffer_capacity: usize,
    max_pooled: usize,
    pooled: AtomicUsize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_capacity` bytes,
    /// retaining at most `max_pooled` of them between uses
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        let buffers = SegQueue::new();

        // Pre-populate so the first connections hit the pool
        let initial = std::cmp::min(max_pooled / 4, 16);
        for _ in 0..initial {
            buffers.push(BytesMut::with_capacity(buffer_capacity));
        }

        Self {
            buffers,
            buffer_capacity,
            max_pooled,
            pooled: AtomicUsize::new(initial),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Get a cleared buffer with at least `size` bytes of capacity
    ///
    /// Requests at or below the pooled capacity are served from the pool
    /// when possible; larger requests always allocate fresh.
    pub fn acquire(&self, size: usize) -> BytesMut {
        if size <= self.buffer_capacity {
            if let Some(mut buffer) = self.buffers.pop() {
                self.pooled.fetch_sub(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                buffer.clear();
                return buffer;
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return BytesMut::with_capacity(self.buffer_capacity);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(size)
    }

    /// Return a buffer to the pool
    ///
    /// Undersized buffers and buffers beyond the retention cap are dropped.
    pub fn release(&self, buffer: BytesMut) {
        if buffer.capacity() < self.buffer_capacity {
            return;
        }
        if self.pooled.load(Ordering::Relaxed) < self.max_pooled {
            self.buffers.push(buffer);
            self.pooled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Capacity of the buffers this pool hands out
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Get pool statistics
    pub fn stats(&self) -> BufferPoolStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        BufferPoolStats {
            hits,
            misses,
            hit_ratio: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            pooled: self.pooled.load(Ordering::Relaxed),
            max_pooled: self.max_pooled,
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("pooled", &self.pooled.load(Ordering::Relaxed))
            .field("max_pooled", &self.max_pooled)
            .finish()
    }
}

/// Snapshot of pool behavior
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    pub hits: usize,
    pub misses: usize,
    pub hit_ratio: f64,
    pub pooled: usize,
    pub max_pooled: usize,
}
