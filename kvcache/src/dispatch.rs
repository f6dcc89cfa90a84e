//! Submission and completion dispatch for one queue pair.
//!
//! [`Dispatcher`] owns everything between "caller has a prepared work
//! request" and "callback has run": the context table, the throttler, the
//! FIFO of requests awaiting a response frame, and the in-flight counter.
//! The hardware side is abstracted behind [`Poster`] so the whole path runs
//! against a mock in tests.

use crate::completion::{
    Callback, ContextTable, InflightTracker, ResponseWaiter, WorkCompletion, WrContext,
};
use crate::error::{KvError, Result};
use crate::pool::{Pooled, ScratchPool};
use crate::protocol::decode_response;
use crate::throttle::{Admission, Throttler, Weighted};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A prepared send-queue submission. Only its last work request is
/// signaled; `wr_id` is that request's id.
pub trait WorkRequest: Weighted + Send {
    fn wr_id(&self) -> u64;
}

/// Hands work to the hardware.
pub trait Poster: Send + Sync {
    /// Scratch buffer type used for requests and responses.
    type Buf: AsRef<[u8]> + Send;
    type Work: WorkRequest;

    fn post_send(&self, work: &mut Self::Work) -> Result<()>;

    fn post_recv(&self, wr_id: u64, buf: &Self::Buf) -> Result<()>;
}

struct SubmitState<W> {
    throttle: Throttler<W>,
    responses: VecDeque<ResponseWaiter>,
}

pub struct Dispatcher<P: Poster> {
    poster: P,
    table: ContextTable<P::Buf>,
    submit: Mutex<SubmitState<P::Work>>,
    recv_pool: Arc<ScratchPool<P::Buf>>,
    inflight: InflightTracker,
    outstanding: AtomicUsize,
    peak_outstanding: AtomicUsize,
    broken: AtomicBool,
    closed: AtomicBool,
}

impl<P: Poster> Dispatcher<P> {
    /// `capacity` is the send-queue depth; `recv_pool` supplies the standing
    /// receive buffers.
    pub fn new(poster: P, capacity: usize, recv_pool: Arc<ScratchPool<P::Buf>>) -> Self {
        Self {
            poster,
            table: ContextTable::new(),
            submit: Mutex::new(SubmitState {
                throttle: Throttler::new(capacity),
                responses: VecDeque::new(),
            }),
            recv_pool,
            inflight: InflightTracker::new(),
            outstanding: AtomicUsize::new(0),
            peak_outstanding: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn poster(&self) -> &P {
        &self.poster
    }

    pub fn next_wr_id(&self) -> u64 {
        self.table.next_wr_id()
    }

    /// Post every buffer of the receive pool. Returns how many were posted.
    pub fn prime_receives(&self) -> Result<usize> {
        let mut posted = 0;
        while let Some(buf) = self.recv_pool.acquire() {
            self.post_receive(buf)?;
            posted += 1;
        }
        tracing::debug!(posted, "receive queue primed");
        Ok(posted)
    }

    fn post_receive(&self, buf: Pooled<P::Buf>) -> Result<()> {
        let wr_id = self.table.next_wr_id();
        self.table
            .insert_and_post(wr_id, WrContext::Recv { buf }, |ctx| match ctx {
                WrContext::Recv { buf } => self.poster.post_recv(wr_id, buf.get()),
                other => Err(KvError::InvalidRequest(format!(
                    "wr {wr_id} holds a {} context",
                    other.kind()
                ))),
            })
    }

    /// Submit a framed request sent from `buf`; its response settles `waiter`.
    pub fn submit_message(
        &self,
        work: P::Work,
        buf: Pooled<P::Buf>,
        waiter: ResponseWaiter,
    ) -> Result<()> {
        let weight = work.weight();
        self.submit(work, WrContext::Send { buf, weight }, Some(waiter))
    }

    /// Submit an RDMA write chain; `callback` runs when its tail completes.
    pub fn submit_write(
        &self,
        work: P::Work,
        remote_addrs: Vec<u64>,
        callback: Callback<()>,
    ) -> Result<()> {
        let weight = work.weight();
        self.submit(
            work,
            WrContext::WriteAck {
                callback,
                remote_addrs,
                weight,
            },
            None,
        )
    }

    /// Register the context, then post or park the work under the
    /// submission lock. On `Err` nothing was accepted and no callback will
    /// run.
    fn submit(
        &self,
        work: P::Work,
        ctx: WrContext<P::Buf>,
        waiter: Option<ResponseWaiter>,
    ) -> Result<()> {
        self.check_usable()?;
        let wr_id = work.wr_id();
        let weight = work.weight();
        let tracked = waiter.is_some() || matches!(ctx, WrContext::WriteAck { .. });
        let has_waiter = waiter.is_some();

        self.table.insert(wr_id, ctx)?;
        let mut state = self.lock_submit()?;

        let admission = match self.check_usable().and_then(|_| state.throttle.admit(work)) {
            Ok(a) => a,
            Err(e) => {
                drop(state);
                self.table.take(wr_id)?;
                return Err(e);
            }
        };
        if tracked {
            self.inflight.begin()?;
        }
        if let Some(w) = waiter {
            state.responses.push_back(w);
        }

        match admission {
            Admission::Post(mut work) => {
                if let Err(e) = self.poster.post_send(&mut work) {
                    tracing::warn!(wr_id, error = %e, "post_send failed");
                    state.throttle.release(weight);
                    if has_waiter {
                        state.responses.pop_back();
                    }
                    self.publish_outstanding(&state);
                    drop(state);
                    self.table.take(wr_id)?;
                    if tracked {
                        self.inflight.end()?;
                    }
                    return Err(e);
                }
            }
            Admission::Deferred => {
                tracing::debug!(
                    wr_id,
                    weight,
                    deferred = state.throttle.deferred_len(),
                    "send queue full, deferring"
                );
            }
        }
        self.publish_outstanding(&state);
        Ok(())
    }

    /// Settle one drained completion.
    pub fn complete(&self, wc: WorkCompletion) -> Result<()> {
        let Some(ctx) = self.table.take(wc.wr_id)? else {
            tracing::warn!(wr_id = wc.wr_id, "completion for unknown work request");
            return Ok(());
        };

        let failure = wc.error();
        if let Some(e) = &failure {
            // Flush errors after the first failure are expected noise.
            if !self.broken.swap(true, Ordering::AcqRel) {
                tracing::error!(kind = ctx.kind(), error = %e, "work completion failed, connection unusable");
            } else {
                tracing::debug!(kind = ctx.kind(), error = %e, "flushed work request");
            }
        }

        let weight = ctx.weight();
        match ctx {
            WrContext::Send { buf, .. } => drop(buf),
            WrContext::WriteAck {
                callback,
                remote_addrs,
                ..
            } => {
                match failure {
                    None => {
                        tracing::debug!(
                            wr_id = wc.wr_id,
                            blocks = remote_addrs.len(),
                            "rdma write complete"
                        );
                        callback(Ok(()));
                    }
                    Some(e) => callback(Err(e)),
                }
                self.inflight.end()?;
            }
            WrContext::Recv { buf } => {
                if failure.is_none() {
                    let bytes: &[u8] = buf.get().as_ref();
                    let response = decode_response(&bytes[..wc.byte_len.min(bytes.len())]);
                    let waiter = self.lock_submit()?.responses.pop_front();
                    if let Err(e) = self.post_receive(buf) {
                        tracing::error!(error = %e, "failed to re-post receive buffer");
                        self.broken.store(true, Ordering::Release);
                    }
                    match waiter {
                        Some(w) => {
                            if let Err(e) = &response {
                                tracing::warn!(waiter = w.kind(), error = %e, "undecodable response");
                            }
                            w.fulfil(response);
                            self.inflight.end()?;
                        }
                        None => tracing::warn!("response with no outstanding request"),
                    }
                }
            }
        }

        self.release(weight)?;
        if self.is_broken() {
            self.fail_pending(|| KvError::ConnectionBroken)?;
        }
        Ok(())
    }

    /// Return `weight` slots and post whatever parked work now fits.
    fn release(&self, weight: usize) -> Result<()> {
        let mut failed = Vec::new();
        {
            let mut state = self.lock_submit()?;
            if weight > 0 {
                state.throttle.release(weight);
            }
            if !self.is_broken() {
                while let Some(mut work) = state.throttle.next_ready() {
                    if let Err(e) = self.poster.post_send(&mut work) {
                        tracing::error!(wr_id = work.wr_id(), error = %e, "post of deferred work failed");
                        self.broken.store(true, Ordering::Release);
                        state.throttle.release(work.weight());
                        failed.push(work.wr_id());
                        break;
                    }
                }
            }
            self.publish_outstanding(&state);
        }
        for wr_id in failed {
            self.fail_context(wr_id, KvError::ConnectionBroken)?;
        }
        Ok(())
    }

    fn fail_context(&self, wr_id: u64, err: KvError) -> Result<()> {
        if let Some(ctx) = self.table.take(wr_id)? {
            if ctx.fail(err) {
                self.inflight.end()?;
            }
        }
        Ok(())
    }

    /// Fail everything that has not reached the hardware: parked work and
    /// requests still waiting for a response frame.
    fn fail_pending(&self, make_err: impl Fn() -> KvError) -> Result<()> {
        let (deferred, waiters) = {
            let mut state = self.lock_submit()?;
            let deferred = state.throttle.take_deferred();
            let waiters: Vec<_> = state.responses.drain(..).collect();
            (deferred, waiters)
        };
        for work in deferred {
            self.fail_context(work.wr_id(), make_err())?;
        }
        for w in waiters {
            w.fail(make_err());
            self.inflight.end()?;
        }
        Ok(())
    }

    /// Settle every remaining context and waiter with `ConnectionClosed`.
    /// Call once the completion engine has stopped.
    pub fn shutdown(&self) -> Result<usize> {
        self.closed.store(true, Ordering::Release);
        let settled = self.settle_all(|| KvError::ConnectionClosed)?;
        if settled > 0 {
            tracing::info!(settled, "failed in-flight operations at shutdown");
        }
        Ok(settled)
    }

    /// Fail parked work, response waiters and every posted context, then
    /// return all send-queue slots. Only valid once no completion can
    /// arrive anymore.
    fn settle_all(&self, make_err: impl Fn() -> KvError) -> Result<usize> {
        self.fail_pending(&make_err)?;
        let mut settled = 0;
        for (_, ctx) in self.table.drain()? {
            if ctx.fail(make_err()) {
                self.inflight.end()?;
                settled += 1;
            }
        }
        let mut state = self.lock_submit()?;
        let held = state.throttle.outstanding();
        state.throttle.release(held);
        self.publish_outstanding(&state);
        Ok(settled)
    }

    /// Block until every accepted operation has settled.
    pub fn wait_idle(&self) -> Result<()> {
        self.inflight.wait_idle()?;
        self.check_usable()
    }

    /// Like [`wait_idle`](Self::wait_idle), giving up after `timeout`.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> Result<bool> {
        let idle = self.inflight.wait_idle_timeout(timeout)?;
        self.check_usable()?;
        Ok(idle)
    }

    /// Flag the connection unusable after the completion engine has died.
    /// No completion will be drained again, so everything still posted is
    /// failed with `ConnectionBroken` here.
    pub fn mark_broken(&self) -> Result<()> {
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::error!("connection marked broken");
        }
        let settled = self.settle_all(|| KvError::ConnectionBroken)?;
        if settled > 0 {
            tracing::warn!(settled, "failed posted operations on broken connection");
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(KvError::ConnectionClosed)
        } else if self.is_broken() {
            Err(KvError::ConnectionBroken)
        } else {
            Ok(())
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Send-queue slots currently reserved.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Highest value [`outstanding`](Self::outstanding) has reached.
    pub fn peak_outstanding(&self) -> usize {
        self.peak_outstanding.load(Ordering::Acquire)
    }

    pub fn deferred(&self) -> usize {
        self.submit
            .lock()
            .map(|s| s.throttle.deferred_len())
            .unwrap_or(0)
    }

    pub fn awaiting_response(&self) -> usize {
        self.submit.lock().map(|s| s.responses.len()).unwrap_or(0)
    }

    /// Accepted operations whose callback has not run.
    pub fn in_flight(&self) -> usize {
        self.inflight.current()
    }

    /// Live contexts, receive buffers included.
    pub fn live_contexts(&self) -> usize {
        self.table.len()
    }

    fn publish_outstanding(&self, state: &SubmitState<P::Work>) {
        let n = state.throttle.outstanding();
        self.outstanding.store(n, Ordering::Release);
        self.peak_outstanding.fetch_max(n, Ordering::AcqRel);
    }

    fn lock_submit(&self) -> Result<MutexGuard<'_, SubmitState<P::Work>>> {
        self.submit
            .lock()
            .map_err(|_| KvError::LockPoisoned("submission"))
    }
}
