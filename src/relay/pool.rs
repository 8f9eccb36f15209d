//! Fixed-size copy buffers shared by all relay sessions.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Size of one copy buffer (32 KiB)
pub const BUF_SIZE: usize = 32 * 1024;

/// Idle buffers kept around by default
const DEFAULT_MAX_IDLE: usize = 256;

/// Free-list of copy buffers.
///
/// Buffers are handed out as [`PooledBuffer`] guards and go back to the list
/// when the guard drops, whichever way the copy loop exits.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    buf_size: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Pool of [`BUF_SIZE`] buffers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BUF_SIZE, DEFAULT_MAX_IDLE)
    }

    /// Pool of `buf_size` buffers, keeping at most `max_idle` of them.
    #[must_use]
    pub fn with_capacity(buf_size: usize, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_size,
            max_idle,
        }
    }

    /// Take a buffer, allocating when the free-list is empty.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size].into_boxed_slice());

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently waiting in the free-list.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_have_fixed_size() {
        let pool = Arc::new(BufferPool::new());
        let buf = pool.get();
        assert_eq!(buf.len(), BUF_SIZE);
    }

    #[test]
    fn dropped_buffer_returns_to_pool() {
        let pool = Arc::new(BufferPool::with_capacity(16, 4));
        assert_eq!(pool.idle(), 0);

        let a = pool.get();
        let b = pool.get();
        drop(a);
        assert_eq!(pool.idle(), 1);
        drop(b);
        assert_eq!(pool.idle(), 2);

        // WHEN: a buffer is taken again
        let _c = pool.get();
        // THEN: it comes from the free-list
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn idle_list_is_capped() {
        let pool = Arc::new(BufferPool::with_capacity(8, 1));
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn buffer_returns_on_panic_unwind() {
        let pool = Arc::new(BufferPool::with_capacity(8, 4));
        let p = Arc::clone(&pool);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _buf = p.get();
            panic!("copy loop failed");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);
    }
}
