//! Reusable byte buffers for the compression path.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default number of idle buffers kept for reuse.
pub const DEFAULT_MAX_IDLE: usize = 8;

/// A pool of `Vec<u8>` buffers.
///
/// Buffers are cleared when returned, so a borrower always starts from an
/// empty buffer that may already have capacity. At most `max_idle` buffers
/// are retained; extras are dropped on release.
#[derive(Debug, Clone)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
    max_idle: usize,
}

impl BufferPool {
    /// Creates a pool retaining up to `max_idle` buffers.
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::with_capacity(max_idle))),
            max_idle,
        }
    }

    /// Borrows a cleared buffer.
    #[must_use]
    pub fn get(&self) -> PooledBuffer {
        let buf = self.idle.lock().pop().unwrap_or_default();
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Returns the number of idle buffers.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

/// A buffer on loan from a [`BufferPool`], returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
