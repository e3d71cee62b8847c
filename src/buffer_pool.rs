//! A shared byte-buffer pool with a single fixed size class (default 4 KiB),
//! generalizing the `[u8; N]` read buffers the connection layer used to
//! allocate per read. All network reads rent a buffer from here and freeze
//! the populated prefix into a `Frame`'s `data` with no copy; the backing
//! allocation returns to the pool once every clone of that `Bytes` has been
//! dropped, bounding memory under load (spec.md §1 "zero-copy buffer
//! discipline", §5 "Buffer pooling").

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

pub const DEFAULT_CLASS_SIZE: usize = 4096;

struct Inner {
    class_size: usize,
    free: Mutex<Vec<BytesMut>>,
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    pub fn new(class_size: usize) -> Self {
        BufferPool {
            inner: Arc::new(Inner {
                class_size,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn class_size(&self) -> usize {
        self.inner.class_size
    }

    /// Rent a zero-filled buffer of this pool's class size, reusing a
    /// previously returned allocation when one is available.
    pub fn rent(&self) -> PooledBuffer {
        let mut buf = {
            let mut free = self.inner.free.lock().unwrap();
            free.pop().unwrap_or_default()
        };
        buf.clear();
        buf.resize(self.inner.class_size, 0);
        PooledBuffer {
            pool: self.clone(),
            buf: Some(buf),
        }
    }

    /// Recover the allocation behind a frozen `Bytes` once nothing else
    /// references it, so the next `rent` reuses it instead of allocating. A
    /// `Bytes` still shared elsewhere, or one that never came from this
    /// pool's `BytesMut`, is simply dropped by the caller (spec.md §5).
    pub fn reclaim(&self, data: Bytes) {
        if let Ok(buf) = data.try_into_mut() {
            self.inner.free.lock().unwrap().push(buf);
        }
    }

    /// Number of allocations currently sitting idle in the free list.
    pub fn idle_count(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/// A rented scratch buffer for one network read. `freeze` turns the
/// populated prefix into a zero-copy `Bytes` view over this same
/// allocation — a `Frame`'s `data` is never copied out of it — while a
/// `PooledBuffer` dropped without being frozen (an error path that never
/// produced a frame) returns its allocation to the pool directly.
pub struct PooledBuffer {
    pool: BufferPool,
    buf: Option<BytesMut>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    /// Truncate to the `len` bytes actually read and freeze into a `Bytes`
    /// backed by this same allocation.
    pub fn freeze(mut self, len: usize) -> Bytes {
        let mut buf = self.buf.take().unwrap_or_default();
        buf.truncate(len);
        buf.freeze()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.inner.free.lock().unwrap().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rented_buffers_return_to_the_free_list_on_drop() {
        let pool = BufferPool::new(DEFAULT_CLASS_SIZE);
        assert_eq!(pool.idle_count(), 0);
        {
            let buf = pool.rent();
            assert_eq!(buf.as_slice().len(), DEFAULT_CLASS_SIZE);
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn reuses_returned_allocations_instead_of_growing_unbounded() {
        let pool = BufferPool::new(DEFAULT_CLASS_SIZE);
        for _ in 0..100 {
            let _ = pool.rent();
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn freezing_yields_exactly_the_bytes_read_with_no_copy() {
        let pool = BufferPool::new(DEFAULT_CLASS_SIZE);
        let mut buf = pool.rent();
        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        let data = buf.freeze(5);
        assert_eq!(&data[..], b"hello");
    }

    #[test]
    fn reclaiming_an_uniquely_held_frame_returns_the_allocation() {
        let pool = BufferPool::new(DEFAULT_CLASS_SIZE);
        let buf = pool.rent();
        let data = buf.freeze(4);
        assert_eq!(pool.idle_count(), 0);
        pool.reclaim(data);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn reclaiming_a_still_shared_frame_is_a_no_op() {
        let pool = BufferPool::new(DEFAULT_CLASS_SIZE);
        let buf = pool.rent();
        let data = buf.freeze(4);
        let _clone = data.clone();
        pool.reclaim(data);
        assert_eq!(pool.idle_count(), 0);
    }
}
