//! Fixed-capacity pool of scratch buffers.
//!
//! RDMA send/receive scratch space must be registered with the NIC, which is
//! slow, so buffers are registered once at setup and recycled. The pool is a
//! hard bound: when it is empty, acquisition fails instead of allocating.

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A bounded pool of pre-built buffers.
pub struct ScratchPool<B> {
    name: &'static str,
    queue: ArrayQueue<B>,
    capacity: usize,
    in_use: AtomicUsize,
}

impl<B> ScratchPool<B> {
    /// Build a pool holding every buffer from `buffers`. Capacity is the
    /// number of buffers supplied and never changes.
    pub fn new(name: &'static str, buffers: Vec<B>) -> Arc<Self> {
        let capacity = buffers.len();
        let queue = ArrayQueue::new(capacity.max(1));
        for buf in buffers {
            if queue.push(buf).is_err() {
                unreachable!("queue sized to the buffer count");
            }
        }
        Arc::new(Self {
            name,
            queue,
            capacity,
            in_use: AtomicUsize::new(0),
        })
    }

    /// Borrow one buffer, or `None` if every buffer is already borrowed.
    pub fn acquire(self: &Arc<Self>) -> Option<Pooled<B>> {
        let buf = self.queue.pop()?;
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(Pooled {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    fn give_back(&self, buf: B) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        if self.queue.push(buf).is_err() {
            // Only buffers taken from this queue come back, so it cannot be full.
            tracing::error!(pool = self.name, "scratch pool overflow on release");
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently borrowed.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Buffers ready to be borrowed.
    pub fn available(&self) -> usize {
        self.queue.len()
    }
}

/// A borrowed buffer. Goes back to its pool exactly once: on
/// [`release`](Self::release) or on drop.
pub struct Pooled<B> {
    buf: Option<B>,
    pool: Arc<ScratchPool<B>>,
}

impl<B> Pooled<B> {
    pub fn release(self) {
        drop(self)
    }

    pub fn get(&self) -> &B {
        self.buf.as_ref().expect("buffer taken after drop")
    }

    pub fn get_mut(&mut self) -> &mut B {
        self.buf.as_mut().expect("buffer taken after drop")
    }
}

impl<B> Deref for Pooled<B> {
    type Target = B;
    fn deref(&self) -> &B {
        self.get()
    }
}

impl<B> DerefMut for Pooled<B> {
    fn deref_mut(&mut self) -> &mut B {
        self.get_mut()
    }
}

impl<B> Drop for Pooled<B> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

impl<B: std::fmt::Debug> std::fmt::Debug for Pooled<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.name)
            .field("buf", &self.buf)
            .finish()
    }
}
