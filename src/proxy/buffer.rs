//! Datagram buffer pool
//!
//! Buffers are checked out for one read/write cycle and returned to the
//! pool when the guard is dropped, which happens only after the datagram
//! has been written to its destination. The free list is a lock-free
//! bounded queue shared by every worker and flow reader of an engine.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

#[derive(Debug)]
struct PoolInner {
    free: ArrayQueue<BytesMut>,
    buffer_size: usize,
}

impl PoolInner {
    fn alloc(&self) -> BytesMut {
        BytesMut::zeroed(self.buffer_size)
    }

    fn return_buffer(&self, buf: BytesMut) {
        if buf.len() != self.buffer_size {
            return;
        }
        // Pool full: the buffer is dropped
        let _ = self.free.push(buf);
    }
}

/// Shared pool of fixed-size datagram buffers
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes and keeping
    /// at most `max_pooled` idle buffers around
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(max_pooled.max(1)),
                buffer_size,
            }),
        }
    }

    /// Size of every buffer handed out
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of idle buffers currently pooled
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Maximum number of idle buffers kept
    pub fn capacity(&self) -> usize {
        self.inner.free.capacity()
    }

    /// Check out a buffer, allocating if the pool is empty
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .pop()
            .unwrap_or_else(|| self.inner.alloc());
        PooledBuffer {
            buf,
            pool: self.inner.clone(),
        }
    }
}

/// RAII guard that returns its buffer to the pool on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf[..]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf[..]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.return_buffer(buf);
    }
}
