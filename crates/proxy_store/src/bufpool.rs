//! A small pool of reusable 64 KiB byte buffers.
//!
//! Shared across the content store's buffered copy paths and the streaming
//! downloader's fan-out sink, so repeated large transfers don't churn the
//! allocator. Every borrow is returned on all exit paths via `Drop`.

use std::sync::Mutex;

/// Size of each pooled buffer.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// A bounded pool of reusable buffers.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BufferPool {
    /// Creates a pool that retains at most `max_pooled` buffers; excess
    /// returns are simply dropped instead of grown without bound.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Borrows a zeroed `BUFFER_SIZE`-byte buffer, reusing a returned one if
    /// available.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let mut buf = self
            .buffers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE]);
        buf.resize(BUFFER_SIZE, 0);
        PooledBuffer {
            pool: self,
            buf: Some(buf),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        let mut buffers = self
            .buffers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`]. Returned to the pool on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<Vec<u8>>,
}

impl std::ops::Deref for PooledBuffer<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
