//! Bounded pool of fixed-size byte buffers
//!
//! A [`Buffer`] is either free inside the pool or exclusively owned by one
//! caller. Checking one out holds a semaphore permit, so at most `capacity`
//! buffers are ever outstanding and [`BufferPool::get`] waits instead of
//! allocating more. Producers that cannot get a buffer stall, which is how
//! backpressure propagates to socket read loops.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{trace, warn};

struct PoolShared {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    permits: Arc<Semaphore>,
    allocated: AtomicUsize,
    misplaced_returns: AtomicU64,
}

impl PoolShared {
    fn recycle(&self, data: Vec<u8>) {
        let mut free = self.free.lock().unwrap();
        free.push(data);
    }
}

/// Snapshot of pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub buffer_size: usize,
    pub capacity: usize,
    /// Buffers currently checked out
    pub outstanding: usize,
    /// Buffers allocated so far (free + outstanding)
    pub allocated: usize,
    /// Buffers handed to `put` on the wrong pool
    pub misplaced_returns: u64,
}

/// Handle to a buffer pool, cheap to clone
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl BufferPool {
    /// Create a pool of `capacity` buffers of `buffer_size` bytes each
    ///
    /// Buffers are allocated lazily and recycled forever after.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        assert!(buffer_size > 0, "buffer size must be positive");
        assert!(capacity > 0, "pool capacity must be positive");

        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                capacity,
                free: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(capacity)),
                allocated: AtomicUsize::new(0),
                misplaced_returns: AtomicU64::new(0),
            }),
        }
    }

    /// Check out a buffer, waiting while `capacity` buffers are outstanding
    pub async fn get(&self) -> Buffer {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("buffer pool semaphore is never closed");
        self.checkout(permit)
    }

    /// Check out a buffer if one is available right now
    pub fn try_get(&self) -> Option<Buffer> {
        let permit = self.shared.permits.clone().try_acquire_owned().ok()?;
        Some(self.checkout(permit))
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Buffer {
        let recycled = self.shared.free.lock().unwrap().pop();
        let data = match recycled {
            Some(data) => data,
            None => {
                let allocated = self.shared.allocated.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Allocating pool buffer {}/{}", allocated, self.shared.capacity);
                vec![0u8; self.shared.buffer_size]
            }
        };

        Buffer {
            data,
            len: 0,
            pool: self.shared.clone(),
            _permit: permit,
        }
    }

    /// Return a buffer to the pool
    ///
    /// Dropping a buffer has the same effect; `put` additionally checks that
    /// the buffer was checked out from this pool.
    pub fn put(&self, buffer: Buffer) {
        if !Arc::ptr_eq(&buffer.pool, &self.shared) {
            self.shared.misplaced_returns.fetch_add(1, Ordering::Relaxed);
            warn!("Buffer returned to a pool it was not checked out from");
            debug_assert!(false, "buffer returned to a foreign pool");
        }
        // Dropping routes the buffer back to the pool that owns it.
        drop(buffer);
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of buffers currently checked out
    pub fn outstanding(&self) -> usize {
        self.shared.capacity - self.shared.permits.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buffer_size: self.shared.buffer_size,
            capacity: self.shared.capacity,
            outstanding: self.outstanding(),
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            misplaced_returns: self.shared.misplaced_returns.load(Ordering::Relaxed),
        }
    }
}

/// A fixed-capacity byte region checked out from a [`BufferPool`]
///
/// Dereferences to the filled part (`..len`).
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolShared>,
    // Released after `Drop::drop` has recycled `data`.
    _permit: OwnedSemaphorePermit,
}

impl Buffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole region, for reading into
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Mark the first `len` bytes as filled
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len(), "length exceeds buffer capacity");
        self.len = len;
    }

    /// Copy `bytes` into the buffer, returning how many fit
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.recycle(data);
    }
}
