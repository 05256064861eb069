// Pooled receive buffers
//
// Readers accumulate connection bytes in leased buffers. A partial read
// keeps the lease; a completed frame transfers the lease to the listener,
// which returns the storage when the frame is read or dropped. The
// outstanding count makes lost leases visible to tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Free list of receive buffers.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_pooled: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
            max_pooled,
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn lease(self: &Arc<Self>) -> PooledBuffer {
        let storage = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            storage: Some(storage),
            pool: Arc::clone(self),
        }
    }

    /// Leases not yet returned; zero once all frames are consumed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn give_back(&self, mut storage: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        storage.clear();
        // Buffers grown far past the lease size are cheaper to drop.
        if storage.capacity() <= self.buffer_size * 4 {
            let mut free = self.free.lock();
            if free.len() < self.max_pooled {
                free.push(storage);
            }
        }
    }
}

/// A leased accumulation buffer owned by one connection.
pub struct PooledBuffer {
    storage: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Bytes accumulated so far.
    pub fn chunk(&self) -> &[u8] {
        self.storage.as_ref().expect("buffer present until drop")
    }

    /// Mutable handle for socket reads.
    pub fn storage_mut(&mut self) -> &mut BytesMut {
        self.storage.as_mut().expect("buffer present until drop")
    }

    /// Transfer this buffer into a frame covering `start..end`.
    ///
    /// Leftover bytes past `end` (a pipelined next message) move to the
    /// fresh lease handed back for continued accumulation.
    pub fn into_frame(mut self, start: usize, end: usize) -> (LazyFrame, PooledBuffer) {
        let pool = Arc::clone(&self.pool);
        let mut next = pool.lease();

        let storage = self.storage.take().expect("buffer present until drop");
        if storage.len() > end {
            next.storage_mut().extend_from_slice(&storage[end..]);
        }

        let frame = LazyFrame {
            storage: Some(storage),
            start,
            end,
            pool,
        };
        (frame, next)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.give_back(storage);
        }
    }
}

/// One-shot lazy view of a complete frame.
///
/// Reading consumes the frame; either way the storage returns to the pool
/// exactly once.
pub struct LazyFrame {
    storage: Option<BytesMut>,
    start: usize,
    end: usize,
    pool: Arc<BufferPool>,
}

impl LazyFrame {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the payload without copying it out, then release the buffer.
    pub fn read<R>(mut self, f: impl FnOnce(&[u8]) -> R) -> R {
        let storage = self.storage.take().expect("frame unread until now");
        let result = f(&storage[self.start..self.end]);
        self.pool.give_back(storage);
        result
    }
}

impl Drop for LazyFrame {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.give_back(storage);
        }
    }
}
