//! Recycled byte buffers for the capture hot path

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;

/// Buffers kept for reuse when none is configured
pub const DEFAULT_POOL_CAPACITY: usize = 8;

/// A buffer checked out of a [`BufferPool`]
///
/// The holder owns it outright; giving it back to the pool consumes it, so nothing can
/// keep a reference to a buffer the pool may hand to someone else.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Address of the backing storage, for identity checks
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Bounded cache of byte buffers
///
/// A miss never fails, it only costs an allocation.
pub struct BufferPool {
    slots: ArrayQueue<Vec<u8>>,
    allocations: AtomicUsize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity.max(1)),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Check out a buffer of at least `min_size` bytes
    pub fn acquire(&self, min_size: usize) -> PooledBuffer {
        let data = match self.slots.pop() {
            Some(mut data) => {
                if data.capacity() < min_size {
                    self.allocations.fetch_add(1, Ordering::Relaxed);
                }
                data.resize(min_size, 0);
                data
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0; min_size]
            }
        };
        PooledBuffer { data }
    }

    /// Return a buffer; dropped if the pool is already full
    pub fn release(&self, buffer: PooledBuffer) {
        // ArrayQueue::push hands the value back when full, let it drop
        let _ = self.slots.push(buffer.data);
    }

    /// Buffers currently cached
    pub fn available(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Heap allocations made on behalf of callers so far
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[test]
    fn release_then_acquire_reuses_buffer() {
        let pool = BufferPool::default();
        let buf = pool.acquire(4096);
        assert_eq!(pool.allocations(), 1);
        let ptr = buf.as_ptr();

        pool.release(buf);
        let again = pool.acquire(4096);

        assert_eq!(pool.allocations(), 1);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again.len(), 4096);
    }

    #[test]
    fn reused_buffer_grows_when_too_small() {
        let pool = BufferPool::default();
        pool.release(pool.acquire(16));
        let bigger = pool.acquire(1024);
        assert!(bigger.len() >= 1024);
        assert_eq!(pool.allocations(), 2);
    }

    #[test]
    fn release_beyond_capacity_drops_buffer() {
        let pool = BufferPool::new(2);
        let buffers: Vec<_> = (0..3).map(|_| pool.acquire(8)).collect();
        for buf in buffers {
            pool.release(buf);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn concurrent_acquires_never_share_storage() {
        let pool = Arc::new(BufferPool::default());
        for _ in 0..4 {
            pool.release(pool.acquire(256));
        }

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    pool.acquire(256)
                })
            })
            .collect();

        let held: Vec<PooledBuffer> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut ptrs: Vec<usize> = held.iter().map(|b| b.as_ptr() as usize).collect();
        ptrs.sort_unstable();
        ptrs.dedup();
        assert_eq!(ptrs.len(), held.len());
    }
}
