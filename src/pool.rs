//! Fixed-capacity free-list pools
//!
//! A miss allocates a fresh value instead of failing; releasing into a full
//! pool drops the value.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

/// Types that can be reset and handed out again
pub trait Reuse {
    /// Clear contents before the value goes back on the free list.
    ///
    /// Returns `false` if the value should be dropped instead.
    fn reuse(&mut self) -> bool;
}

impl<T> Reuse for Vec<T> {
    fn reuse(&mut self) -> bool {
        self.clear();
        self.capacity() > 0
    }
}

impl Reuse for BytesMut {
    fn reuse(&mut self) -> bool {
        self.clear();
        true
    }
}

/// Thread-safe free list with a fixed capacity
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    misses: AtomicU64,
}

impl<T: Reuse + Default> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            misses: AtomicU64::new(0),
        }
    }

    /// Take a value from the pool, allocating on a miss
    pub fn acquire(&self) -> T {
        self.free.lock().pop().unwrap_or_else(|| {
            self.misses.fetch_add(1, Ordering::Relaxed);
            T::default()
        })
    }

    /// Return a value; it is dropped if the pool is already full
    pub fn release(&self, mut value: T) {
        if !value.reuse() {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(value);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values currently sitting on the free list
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of acquires that had to allocate
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_allocates() {
        let pool: Pool<Vec<u8>> = Pool::new(2);
        let v = pool.acquire();
        assert!(v.is_empty());
        assert_eq!(pool.misses(), 1);
    }

    #[test]
    fn test_release_and_reuse() {
        let pool: Pool<Vec<u8>> = Pool::new(2);
        let mut v = pool.acquire();
        v.extend_from_slice(&[1, 2, 3]);
        let cap = v.capacity();
        pool.release(v);
        assert_eq!(pool.available(), 1);

        let v = pool.acquire();
        assert!(v.is_empty());
        assert_eq!(v.capacity(), cap);
        assert_eq!(pool.misses(), 1);
    }

    #[test]
    fn test_full_pool_drops() {
        let pool: Pool<BytesMut> = Pool::new(1);
        pool.release(BytesMut::with_capacity(8));
        pool.release(BytesMut::with_capacity(8));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_zero_capacity_vec_is_dropped() {
        let pool: Pool<Vec<u8>> = Pool::new(4);
        pool.release(Vec::new());
        assert_eq!(pool.available(), 0);
    }
}
