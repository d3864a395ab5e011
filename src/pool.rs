//! Reusable packet buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A pool of equal-capacity buffers sized to the MTU.
///
/// Returning buffers is optional: a buffer that never comes back just means the
/// next checkout allocates.
pub struct BufferPool {
    mtu: usize,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `mtu`-sized buffers keeping at most `capacity` idle ones.
    pub fn new(mtu: usize, capacity: usize) -> Self {
        Self {
            mtu,
            capacity,
            free: Mutex::new(Vec::new()),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Check out an empty buffer with capacity of at least `mtu`.
    pub fn get(&self) -> Vec<u8> {
        let reused = self.free.lock().ok().and_then(|mut free| free.pop());
        match reused {
            Some(buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.mtu)
            }
        }
    }

    /// Check out a buffer holding a copy of at most `mtu` bytes of `p`.
    pub fn copy_from(&self, p: &[u8]) -> Vec<u8> {
        let mut buf = self.get();
        let n = p.len().min(self.mtu);
        buf.extend_from_slice(&p[..n]);
        buf
    }

    /// Return a buffer. Buffers smaller than `mtu` are dropped instead.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.mtu {
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(buf);
            }
        }
    }

    /// Buffers created because the pool was empty.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Checkouts served from a returned buffer.
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    /// Buffers currently waiting in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}
