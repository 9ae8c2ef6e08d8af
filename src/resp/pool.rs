//! Reusable I/O buffers.
//!
//! Connections come and go; their read and write buffers should not. A
//! [`BufferPool`] hands out [`Pooled`] buffers that go back to the pool,
//! cleared, when dropped.

use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Initial capacity of socket read buffers.
pub const READ_BUFFER_CAPACITY: usize = 64 * 1024;
/// Initial capacity of command scratch buffers.
pub const WRITE_BUFFER_CAPACITY: usize = 8 * 1024;

const MAX_POOLED: usize = 64;

pub struct BufferPool {
    capacity: usize,
    max_pooled: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(capacity: usize, max_pooled: usize) -> Self {
        Self {
            capacity,
            max_pooled,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer from the pool, allocating when none is idle.
    pub fn get(&self) -> Pooled<'_> {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity));
        Pooled {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Number of buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, mut buf: BytesMut) {
        buf.clear();
        // A buffer that grew for one huge reply, or was split down to
        // nothing, is not worth keeping.
        if buf.capacity() < self.capacity || buf.capacity() > self.capacity * 16 {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct Pooled<'a> {
    buf: Option<BytesMut>,
    pool: &'a BufferPool,
}

impl Deref for Pooled<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // Only `Drop` takes the buffer out.
        self.buf.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for Pooled<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for Pooled<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Process-wide pool of socket read buffers.
pub fn read_buffers() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool::new(READ_BUFFER_CAPACITY, MAX_POOLED))
}

/// Process-wide pool of command scratch buffers.
pub fn write_buffers() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool::new(WRITE_BUFFER_CAPACITY, MAX_POOLED))
}

// ── Tests ──────────────────────────────────────────────────────────
