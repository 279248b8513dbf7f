// bufpool.rs — named fixed-size byte-buffer freelists
//
// Every hot path that needs a scratch buffer (receive staging, send grams,
// compressor output) draws from one of these pools instead of allocating.
// Buffers keep their full size for their whole lifecycle; contents are
// opaque garbage after release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Process-wide registry of live pools, for introspection dumps.
static REGISTRY: Mutex<Vec<Weak<BufferPool>>> = Mutex::new(Vec::new());

pub struct BufferPool {
    name: &'static str,
    buffer_size: usize,
    initial_capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    misses: AtomicUsize,
    created: AtomicUsize,
}

impl BufferPool {
    pub fn new(name: &'static str, initial_capacity: usize, buffer_size: usize) -> Arc<BufferPool> {
        let mut free = Vec::with_capacity(initial_capacity);
        for _ in 0..initial_capacity {
            free.push(vec![0u8; buffer_size].into_boxed_slice());
        }

        let pool = Arc::new(BufferPool {
            name,
            buffer_size,
            initial_capacity,
            free: Mutex::new(free),
            misses: AtomicUsize::new(0),
            created: AtomicUsize::new(initial_capacity),
        });

        let mut registry = REGISTRY.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&pool));

        pool
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Pop a buffer, refilling the freelist by a whole initial-capacity batch
    /// on a miss.
    pub fn acquire(&self) -> Box<[u8]> {
        let mut free = self.free.lock();

        if let Some(buffer) = free.pop() {
            return buffer;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.created
            .fetch_add(self.initial_capacity, Ordering::Relaxed);

        for _ in 0..self.initial_capacity - 1 {
            free.push(vec![0u8; self.buffer_size].into_boxed_slice());
        }

        vec![0u8; self.buffer_size].into_boxed_slice()
    }

    /// Return a buffer to the freelist. The pool does not track identity, so
    /// releasing the same buffer twice is the caller's bug to avoid.
    pub fn release(&self, buffer: Box<[u8]>) {
        debug_assert_eq!(buffer.len(), self.buffer_size);
        self.free.lock().push(buffer);
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// Snapshot of all live pools.
pub fn pools() -> Vec<Arc<BufferPool>> {
    REGISTRY
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let pool = BufferPool::new("test-acquire", 4, 64);
        let a = pool.acquire();
        assert_eq!(a.len(), 64);
        assert_eq!(pool.free_count(), 3);
        pool.release(a);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.misses(), 0);
    }

    #[test]
    fn test_miss_refills_batch() {
        let pool = BufferPool::new("test-miss", 2, 16);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.free_count(), 0);

        let c = pool.acquire();
        assert_eq!(pool.misses(), 1);
        // A miss allocates a fresh batch and hands one of it out.
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.created(), 4);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_registry_lists_pool() {
        let pool = BufferPool::new("test-registry", 1, 8);
        assert!(pools().iter().any(|p| p.name() == "test-registry"));
        drop(pool);
    }
}
