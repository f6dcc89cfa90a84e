//! Completion contexts and the bookkeeping around them.
//!
//! Every posted work request owns exactly one [`WrContext`], keyed by its
//! `wr_id` in a [`ContextTable`]. A context is removed from the table before
//! it is acted on, so a second completion for the same id finds nothing and
//! no callback can run twice.

use crate::error::{KvError, Result};
use crate::pool::Pooled;
use crate::protocol::Response;
use crate::types::RemoteBlock;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Single-shot result callback of an asynchronous operation.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Outcome reported by the hardware for one work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Failed { status: u32, vendor_err: u32 },
}

/// A drained completion-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    /// Bytes written into the buffer, for receive completions.
    pub byte_len: usize,
}

impl WorkCompletion {
    pub fn success(wr_id: u64, byte_len: usize) -> Self {
        Self {
            wr_id,
            status: WcStatus::Success,
            byte_len,
        }
    }

    pub fn failed(wr_id: u64, status: u32, vendor_err: u32) -> Self {
        Self {
            wr_id,
            status: WcStatus::Failed { status, vendor_err },
            byte_len: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }

    pub fn error(&self) -> Option<KvError> {
        match self.status {
            WcStatus::Success => None,
            WcStatus::Failed { status, vendor_err } => Some(KvError::WorkCompletion {
                wr_id: self.wr_id,
                status,
                vendor_err,
            }),
        }
    }
}

/// State attached to one posted work request.
pub enum WrContext<B> {
    /// A framed request sent from a scratch buffer. The buffer goes back to
    /// the send pool once the send completes.
    Send { buf: Pooled<B>, weight: usize },
    /// A standing receive buffer for the next response frame.
    Recv { buf: Pooled<B> },
    /// The signaled tail of an RDMA write chain.
    WriteAck {
        callback: Callback<()>,
        remote_addrs: Vec<u64>,
        weight: usize,
    },
}

impl<B> WrContext<B> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Recv { .. } => "recv",
            Self::WriteAck { .. } => "write-ack",
        }
    }

    /// Send-queue slots held until this context completes.
    pub fn weight(&self) -> usize {
        match self {
            Self::Send { weight, .. } | Self::WriteAck { weight, .. } => *weight,
            Self::Recv { .. } => 0,
        }
    }

    /// Settle the context without a successful completion. Buffers return to
    /// their pools; a callback sees `err`. Returns whether a callback ran.
    pub fn fail(self, err: KvError) -> bool {
        match self {
            Self::Send { .. } | Self::Recv { .. } => false,
            Self::WriteAck { callback, .. } => {
                callback(Err(err));
                true
            }
        }
    }
}

impl<B> std::fmt::Debug for WrContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WriteAck {
                remote_addrs,
                weight,
                ..
            } => f
                .debug_struct("WriteAck")
                .field("blocks", &remote_addrs.len())
                .field("weight", weight)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// A request whose answer arrives as a response frame in a receive buffer.
/// Waiters are matched to responses in submission order.
pub enum ResponseWaiter {
    Allocate {
        expected: usize,
        callback: Callback<Vec<RemoteBlock>>,
    },
    ReadAck {
        callback: Callback<()>,
    },
}

impl ResponseWaiter {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Allocate { .. } => "allocate",
            Self::ReadAck { .. } => "read-ack",
        }
    }

    /// Hand a decoded response (or the decode failure) to the callback.
    pub fn fulfil(self, response: Result<Response>) {
        match self {
            Self::Allocate { expected, callback } => {
                callback(response.and_then(|r| match r {
                    Response::Remote(meta) => meta.into_blocks(expected),
                    other => Err(KvError::UnexpectedResponse {
                        expected: "remote",
                        got: other.kind_name(),
                    }),
                }));
            }
            Self::ReadAck { callback } => {
                callback(response.and_then(|r| match r {
                    Response::Local(res) => res.into_value().map(|_| ()),
                    other => Err(KvError::UnexpectedResponse {
                        expected: "local",
                        got: other.kind_name(),
                    }),
                }));
            }
        }
    }

    pub fn fail(self, err: KvError) {
        match self {
            Self::Allocate { callback, .. } => callback(Err(err)),
            Self::ReadAck { callback } => callback(Err(err)),
        }
    }
}

/// `wr_id` → context map.
pub struct ContextTable<B> {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, WrContext<B>>>,
}

impl<B> Default for ContextTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> ContextTable<B> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh work-request id. Ids are never reused within a table.
    pub fn next_wr_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, wr_id: u64, ctx: WrContext<B>) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| KvError::LockPoisoned("context table"))?;
        if slots.insert(wr_id, ctx).is_some() {
            tracing::error!(wr_id, "work request id registered twice");
        }
        Ok(())
    }

    /// Register `ctx` and hand it to `post` while the table is locked, so a
    /// completion can never race ahead of the registration. The entry is
    /// removed again if `post` fails.
    pub fn insert_and_post(
        &self,
        wr_id: u64,
        ctx: WrContext<B>,
        post: impl FnOnce(&WrContext<B>) -> Result<()>,
    ) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| KvError::LockPoisoned("context table"))?;
        let entry = match slots.entry(wr_id) {
            Entry::Occupied(_) => {
                return Err(KvError::InvalidRequest(format!(
                    "work request id {wr_id} already live"
                )));
            }
            Entry::Vacant(v) => v.insert(ctx),
        };
        if let Err(e) = post(entry) {
            slots.remove(&wr_id);
            return Err(e);
        }
        Ok(())
    }

    /// Remove and return the context for `wr_id`, if still live.
    pub fn take(&self, wr_id: u64) -> Result<Option<WrContext<B>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| KvError::LockPoisoned("context table"))?;
        Ok(slots.remove(&wr_id))
    }

    /// Remove every live context.
    pub fn drain(&self) -> Result<Vec<(u64, WrContext<B>)>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| KvError::LockPoisoned("context table"))?;
        let mut all: Vec<_> = slots.drain().collect();
        all.sort_by_key(|(id, _)| *id);
        Ok(all)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Count of accepted operations whose callback has not run yet. Blocking
/// wrappers wait here for it to reach zero.
#[derive(Default)]
pub struct InflightTracker {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Result<()> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| KvError::LockPoisoned("inflight counter"))?;
        *count += 1;
        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| KvError::LockPoisoned("inflight counter"))?;
        if *count == 0 {
            tracing::error!("inflight counter underflow");
        } else {
            *count -= 1;
        }
        self.idle.notify_all();
        Ok(())
    }

    pub fn current(&self) -> usize {
        self.count.lock().map(|c| *c).unwrap_or(0)
    }

    /// Block until every accepted operation has settled.
    pub fn wait_idle(&self) -> Result<()> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| KvError::LockPoisoned("inflight counter"))?;
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .map_err(|_| KvError::LockPoisoned("inflight counter"))?;
        }
        Ok(())
    }

    /// Like [`wait_idle`](Self::wait_idle) but gives up after `timeout`.
    /// Returns whether the counter reached zero.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut count = self
            .count
            .lock()
            .map_err(|_| KvError::LockPoisoned("inflight counter"))?;
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .idle
                .wait_timeout(count, deadline - now)
                .map_err(|_| KvError::LockPoisoned("inflight counter"))?;
            count = guard;
        }
        Ok(true)
    }
}
