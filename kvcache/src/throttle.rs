//! Admission control against queue-pair send capacity.
//!
//! Posting more work requests than the send queue holds overruns the queue
//! pair, which the hardware cannot recover from. [`Throttler`] counts
//! outstanding send-queue slots and parks anything that does not fit in a
//! FIFO. Completions free slots and release parked work strictly in order.
//!
//! The throttler is a plain state machine. Callers keep it behind the same
//! mutex that serializes posting, so admission and wire order are decided
//! together.

use crate::error::{KvError, Result};
use std::collections::VecDeque;

/// Work that occupies one or more send-queue slots until its signaled
/// completion arrives.
pub trait Weighted {
    fn weight(&self) -> usize;
}

/// Outcome of [`Throttler::admit`].
#[derive(Debug)]
pub enum Admission<W> {
    /// Capacity was reserved; post this now.
    Post(W),
    /// Parked behind earlier work.
    Deferred,
}

#[derive(Debug)]
pub struct Throttler<W> {
    capacity: usize,
    outstanding: usize,
    deferred: VecDeque<W>,
}

impl<W: Weighted> Throttler<W> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outstanding: 0,
            deferred: VecDeque::new(),
        }
    }

    /// Reserve capacity for `work` or park it.
    ///
    /// Work is admitted only when nothing is parked, so later submissions
    /// never overtake earlier ones.
    pub fn admit(&mut self, work: W) -> Result<Admission<W>> {
        let weight = work.weight();
        if weight == 0 || weight > self.capacity {
            return Err(KvError::InvalidRequest(format!(
                "work of {weight} requests cannot fit a send queue of {}",
                self.capacity
            )));
        }
        if self.deferred.is_empty() && self.outstanding + weight <= self.capacity {
            self.outstanding += weight;
            Ok(Admission::Post(work))
        } else {
            self.deferred.push_back(work);
            Ok(Admission::Deferred)
        }
    }

    /// Return `weight` slots, after a completion or a failed post.
    pub fn release(&mut self, weight: usize) {
        if weight > self.outstanding {
            tracing::error!(
                weight,
                outstanding = self.outstanding,
                "throttle released more than it reserved"
            );
            self.outstanding = 0;
        } else {
            self.outstanding -= weight;
        }
    }

    /// Pop the FIFO head if it now fits, reserving its capacity.
    pub fn next_ready(&mut self) -> Option<W> {
        let weight = self.deferred.front()?.weight();
        if self.outstanding + weight > self.capacity {
            return None;
        }
        self.outstanding += weight;
        self.deferred.pop_front()
    }

    /// Drop all parked work, returning it in FIFO order.
    pub fn take_deferred(&mut self) -> Vec<W> {
        self.deferred.drain(..).collect()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
