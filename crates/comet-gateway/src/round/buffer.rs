//! Reusable I/O buffers

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A free list of equally sized buffers
///
/// Buffers are handed out by value, so a buffer can only be returned once.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    buf_size: usize,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl BufferPool {
    /// Pool keeping up to `capacity` idle buffers of `buf_size` bytes
    #[must_use]
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| BytesMut::with_capacity(buf_size))
            .collect();
        Self {
            free: Mutex::new(free),
            capacity,
            buf_size,
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    /// Take a buffer, allocating when the pool is empty
    pub fn get(&self) -> BytesMut {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buf_size))
    }

    /// Return a buffer. Extra buffers beyond the pool capacity are dropped.
    pub fn put(&self, mut buf: BytesMut) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Buffers handed out so far
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    /// Buffers returned so far
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    /// Buffers currently handed out. Negative when more buffers came back
    /// than were taken.
    pub fn outstanding(&self) -> isize {
        let gets = self.gets() as isize;
        gets - self.puts() as isize
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle())
            .field("buf_size", &self.buf_size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_put() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.idle(), 2);

        let mut a = pool.get();
        a.extend_from_slice(b"dirty");
        let b = pool.get();
        let c = pool.get();
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.outstanding(), 3);
        assert!(c.capacity() >= 64);

        pool.put(a);
        pool.put(b);
        pool.put(c);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.get().is_empty());
    }

    #[test]
    fn test_extra_put_goes_negative() {
        let pool = BufferPool::new(2, 64);
        let a = pool.get();
        pool.put(a);
        pool.put(BytesMut::new());

        assert_eq!(pool.gets(), 1);
        assert_eq!(pool.puts(), 2);
        assert_eq!(pool.outstanding(), -1);
    }
}
