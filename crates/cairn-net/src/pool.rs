//! Bounded free-list of reusable [`ByteStream`]s.
//!
//! High-frequency small messages churn allocations; the pool amortizes that
//! while keeping two hard bounds: at most `max_free_buffers` idle streams,
//! and no pooled stream with capacity above `max_buffer_size` (an oversized
//! one-off reply must not pin a megabyte forever). Streams move by value —
//! acquire hands ownership out, release takes it back.

use parking_lot::Mutex;

use crate::bytestream::ByteStream;

/// Default cap on idle streams held by the pool.
pub const DEFAULT_MAX_FREE_BUFFERS: usize = 10;

/// Default capacity limit above which a released stream is dropped.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Mutex-guarded free-list of byte streams. O(1) acquire and release.
pub struct ByteStreamPool {
    free: Mutex<Vec<ByteStream>>,
    max_free_buffers: usize,
    max_buffer_size: usize,
}

impl Default for ByteStreamPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FREE_BUFFERS, DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl ByteStreamPool {
    /// Create a pool with explicit bounds.
    #[must_use]
    pub fn new(max_free_buffers: usize, max_buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_free_buffers)),
            max_free_buffers,
            max_buffer_size,
        }
    }

    /// Take a stream: a pooled one if available, otherwise freshly
    /// allocated. Pooled streams come back restarted (empty, capacity
    /// retained).
    #[must_use]
    pub fn acquire(&self) -> ByteStream {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Return a stream. Oversized streams and overflow beyond the free-list
    /// bound are dropped instead of pooled.
    pub fn release(&self, mut stream: ByteStream) {
        if stream.capacity() > self.max_buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() >= self.max_free_buffers {
            return;
        }
        stream.restart();
        free.push(stream);
    }

    /// Current idle count (diagnostics).
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}
