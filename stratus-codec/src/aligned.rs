//! Reusable aligned buffers for validating inbound payloads.

use std::sync::Arc;

use parking_lot::Mutex;
use rkyv::util::AlignedVec;

/// Default capacity of a fresh buffer.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Maximum number of idle buffers kept.
const DEFAULT_POOL_CAPACITY: usize = 32;

/// A buffer borrowed from an [`AlignedBufferPool`].
///
/// Returned to the pool on drop if it has not grown too large.
pub struct PooledBuffer {
    buffer: AlignedVec,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Copy `bytes` into the buffer, replacing its contents.
    pub fn fill(&mut self, bytes: &[u8]) -> &[u8] {
        self.buffer.clear();
        self.buffer.extend_from_slice(bytes);
        self.buffer.as_slice()
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = AlignedVec;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::replace(&mut self.buffer, AlignedVec::new());
        self.pool.release(buffer);
    }
}

struct PoolInner {
    buffers: Mutex<Vec<AlignedVec>>,
    buffer_size: usize,
    capacity: usize,
}

impl PoolInner {
    fn release(&self, mut buffer: AlignedVec) {
        // Oversized buffers would pin memory after one large payload.
        if buffer.capacity() > self.buffer_size * 4 {
            return;
        }
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buffer);
        }
    }
}

/// Pool of aligned buffers.
///
/// rkyv validates archived data in place, which requires aligned memory;
/// broker payloads arrive as plain byte vectors, so every decode copies
/// into one of these buffers first.
#[derive(Clone)]
pub struct AlignedBufferPool {
    inner: Arc<PoolInner>,
}

impl AlignedBufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool with a custom buffer size and idle capacity.
    #[must_use]
    pub fn with_config(buffer_size: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::with_capacity(capacity)),
                buffer_size,
                capacity,
            }),
        }
    }

    /// Take an idle buffer or allocate a new one.
    #[must_use]
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self.inner.buffers.lock().pop();
        let buffer = buffer.unwrap_or_else(|| AlignedVec::with_capacity(self.inner.buffer_size));
        PooledBuffer {
            buffer,
            pool: self.inner.clone(),
        }
    }

    /// Number of idle buffers.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

impl Default for AlignedBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AlignedBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBufferPool")
            .field("available", &self.available())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
