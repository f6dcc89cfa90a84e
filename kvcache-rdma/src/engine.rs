//! The completion thread.
//!
//! One named thread per connection waits on the completion channel, drains
//! the CQ and hands every work completion to the [`Dispatcher`]. The poll
//! timeout only bounds how long a stop request can go unnoticed.

use crate::rdma::{QueuePair, RdmaContext};
use kvcache::{Dispatcher, KvError, Result, WorkCompletion};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Completions drained per `poll_cq` call.
const POLL_BATCH: usize = 32;

pub struct CompletionEngine {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CompletionEngine {
    /// Arm the CQ and start the `kvcache-cq` thread.
    pub fn spawn(
        ctx: Arc<RdmaContext>,
        dispatcher: Arc<Dispatcher<QueuePair>>,
        poll_interval: Duration,
    ) -> Result<Self> {
        ctx.arm_cq()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("kvcache-cq".into())
            .spawn(move || run(&ctx, &dispatcher, &flag, poll_interval))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("completion thread panicked");
            }
        }
    }
}

impl Drop for CompletionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    ctx: &RdmaContext,
    dispatcher: &Dispatcher<QueuePair>,
    stop: &AtomicBool,
    poll_interval: Duration,
) {
    tracing::debug!("completion thread started");
    let mut wcs: Vec<ibverbs_sys::ibv_wc> =
        (0..POLL_BATCH).map(|_| ibverbs_sys::ibv_wc::default()).collect();

    while !stop.load(Ordering::Acquire) {
        let step = wait_readable(ctx.channel_fd(), poll_interval).and_then(|ready| {
            if !ready {
                return Ok(0);
            }
            while ctx.take_cq_event()? {}
            // Re-arm before draining: anything landing mid-drain raises a
            // fresh event instead of being missed.
            ctx.arm_cq()?;
            drain(ctx, dispatcher, &mut wcs)
        });
        match step {
            Ok(n) if n > 0 => tracing::trace!(completions = n, "drained completion queue"),
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "completion thread failed");
                if let Err(e) = dispatcher.mark_broken() {
                    tracing::error!(error = %e, "failed to settle pending work");
                }
                break;
            }
        }
    }
    tracing::debug!("completion thread stopped");
}

fn drain(
    ctx: &RdmaContext,
    dispatcher: &Dispatcher<QueuePair>,
    wcs: &mut [ibverbs_sys::ibv_wc],
) -> Result<usize> {
    let mut total = 0;
    loop {
        let n = ctx.poll_cq(wcs)?;
        if n == 0 {
            return Ok(total);
        }
        for wc in &wcs[..n] {
            dispatcher.complete(to_completion(wc))?;
        }
        total += n;
    }
}

fn to_completion(wc: &ibverbs_sys::ibv_wc) -> WorkCompletion {
    match wc.error() {
        None => WorkCompletion::success(wc.wr_id(), wc.byte_len as usize),
        Some((status, vendor_err)) => WorkCompletion::failed(wc.wr_id(), status as u32, vendor_err),
    }
}

/// `Ok(true)` once the channel fd is readable, `Ok(false)` on timeout or
/// signal.
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(KvError::device_with_source("poll on completion channel failed", err));
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(KvError::device(format!(
            "completion channel closed (revents={:#x})",
            pfd.revents
        )));
    }
    Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
}
