//! The client session: one control channel plus, once set up, one RDMA
//! queue pair to the store.
//!
//! Lifecycle:
//! 1. [`Connection::new`]: validate config, install logging.
//! 2. [`Connection::init_connection`]: TCP control channel.
//! 3. [`Connection::setup_rdma`]: verbs resources, handshake, completion
//!    thread.
//! 4. [`Connection::close_conn`] (or drop): stop the thread, fail whatever
//!    is still outstanding, release everything.
//!
//! Data operations take `&self` and may be called from any number of
//! threads once setup is done.

use crate::engine::CompletionEngine;
use crate::rdma::{
    ForeignRegion, MrRegistry, QueuePair, RdmaContext, RegisteredBuffer, SendChain, WriteSegment,
};
use kvcache::protocol::{IpcMemHandle, RemoteMetaRequest, Request, encode_request_into};
use kvcache::{
    Block, Callback, ClientConfig, ConnectionType, ControlChannel, Dispatcher, KvError, LocalOp,
    RemoteBlock, ResponseWaiter, Result, ScratchPool,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Everything created by `setup_rdma`. Fields drop in declaration order:
/// the thread is gone before the queue pair, and the context goes last.
struct RdmaSession {
    engine: CompletionEngine,
    dispatcher: Arc<Dispatcher<QueuePair>>,
    send_pool: Arc<ScratchPool<RegisteredBuffer>>,
    registry: MrRegistry,
    ctx: Arc<RdmaContext>,
}

impl RdmaSession {
    fn open(config: &ClientConfig, control: &ControlChannel) -> Result<Self> {
        let ctx = Arc::new(RdmaContext::open(config)?);

        let max_send_wr = u32::try_from(config.max_outstanding)
            .map_err(|_| KvError::Config("max_outstanding does not fit u32".into()))?;
        let max_recv_wr = u32::try_from(config.recv_depth)
            .map_err(|_| KvError::Config("recv_depth does not fit u32".into()))?;
        let qp = QueuePair::create(&ctx, max_send_wr, max_recv_wr)?;

        let local = qp.local_info();
        let remote = control.exchange(local)?;
        tracing::debug!(?local, ?remote, "exchanged queue-pair info");
        qp.connect(&remote)?;

        let send_pool = scratch_pool("send", &ctx, config)?;
        let recv_pool = scratch_pool("recv", &ctx, config)?;

        let dispatcher = Arc::new(Dispatcher::new(qp, config.max_outstanding, recv_pool));
        dispatcher.prime_receives()?;
        let engine = CompletionEngine::spawn(
            Arc::clone(&ctx),
            Arc::clone(&dispatcher),
            config.cq_poll_interval,
        )?;

        Ok(Self {
            engine,
            dispatcher,
            send_pool,
            registry: MrRegistry::new(Arc::clone(&ctx)),
            ctx,
        })
    }

    /// Frame `req` into a send buffer and post it; `waiter` gets the reply.
    fn submit_message(&self, req: &Request, waiter: ResponseWaiter) -> Result<()> {
        let mut buf = self
            .send_pool
            .acquire()
            .ok_or(KvError::PoolExhausted("send"))?;
        let len = encode_request_into(req, buf.get_mut().as_mut_slice())?;
        let wr_id = self.dispatcher.next_wr_id();
        let work = SendChain::send(wr_id, buf.get().addr(), len as u32, buf.get().lkey());
        self.dispatcher.submit_message(work, buf, waiter)
    }

    fn close(mut self) {
        self.engine.stop();
        if let Err(e) = self.dispatcher.shutdown() {
            tracing::error!(error = %e, "failed to settle outstanding work at close");
        }
        tracing::info!(
            device = self.ctx.dev_name(),
            regions = self.registry.len(),
            peak_outstanding = self.dispatcher.peak_outstanding(),
            "RDMA session closed"
        );
    }
}

fn scratch_pool(
    name: &'static str,
    ctx: &Arc<RdmaContext>,
    config: &ClientConfig,
) -> Result<Arc<ScratchPool<RegisteredBuffer>>> {
    let buffers = (0..config.recv_depth)
        .map(|_| RegisteredBuffer::new(ctx, config.scratch_buf_size))
        .collect::<Result<Vec<_>>>()?;
    Ok(ScratchPool::new(name, buffers))
}

/// Client session to one store.
pub struct Connection {
    config: ClientConfig,
    control: Option<ControlChannel>,
    rdma: Option<RdmaSession>,
}

impl Connection {
    /// Validate `config` and install logging at its level. Nothing is
    /// connected yet.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.verify()?;
        kvcache::logging::init(&config.log_level)?;
        Ok(Self {
            config,
            control: None,
            rdma: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the TCP control channel.
    pub fn init_connection(&mut self) -> Result<()> {
        if self.control.is_some() {
            return Err(KvError::AlreadyInitialized("control channel"));
        }
        self.control = Some(ControlChannel::connect(&self.config)?);
        Ok(())
    }

    /// Create verbs resources, run the queue-pair handshake over the control
    /// channel and start the completion thread. Runs at most once.
    pub fn setup_rdma(&mut self) -> Result<()> {
        if self.config.connection_type == ConnectionType::Tcp {
            tracing::warn!("setup_rdma called on a TCP-only connection");
            return Err(KvError::NotConnected("rdma"));
        }
        if self.rdma.is_some() {
            return Err(KvError::AlreadyInitialized("rdma"));
        }
        let control = self.control()?;
        let session = RdmaSession::open(&self.config, control).inspect_err(|e| {
            tracing::error!(error = %e, "RDMA setup failed");
        })?;
        self.rdma = Some(session);
        Ok(())
    }

    pub fn is_rdma_ready(&self) -> bool {
        self.rdma.is_some()
    }

    fn control(&self) -> Result<&ControlChannel> {
        self.control.as_ref().ok_or(KvError::NotConnected("control"))
    }

    fn rdma(&self) -> Result<&RdmaSession> {
        self.rdma.as_ref().ok_or(KvError::NotConnected("rdma"))
    }

    // ── Same-host transfers ─────────────────────────────────────────

    /// Queue a same-host copy of `blocks` between the memory behind `handle`
    /// and the store.
    pub fn rw_local(
        &self,
        op: LocalOp,
        blocks: Vec<Block>,
        block_size: u32,
        handle: IpcMemHandle,
    ) -> Result<()> {
        self.control()?.rw_local(op, blocks, block_size, handle)
    }

    /// Block until the store has finished every queued same-host transfer.
    pub fn sync_local(&self) -> Result<()> {
        self.control()?.sync_local(self.config.sync_poll_interval)
    }

    // ── Key queries ─────────────────────────────────────────────────

    pub fn check_exist(&self, key: &str) -> Result<bool> {
        self.control()?.check_exist(key)
    }

    pub fn get_match_last_index(&self, keys: &[String]) -> Result<Option<usize>> {
        self.control()?.get_match_last_index(keys)
    }

    pub fn delete_keys(&self, keys: &[String]) -> Result<usize> {
        self.control()?.delete_keys(keys)
    }

    // ── Small values over TCP ───────────────────────────────────────

    pub fn w_tcp(&self, key: &str, data: &[u8]) -> Result<()> {
        self.control()?.put(key, data)
    }

    pub fn r_tcp(&self, key: &str) -> Result<Vec<u8>> {
        self.control()?.get(key)
    }

    // ── RDMA ────────────────────────────────────────────────────────

    /// Register `[ptr, ptr + len)` so it can be an RDMA source or target.
    /// Registering the same base again returns the existing region.
    ///
    /// # Safety
    ///
    /// The range must stay allocated until the connection is closed.
    pub unsafe fn register_mr(&self, ptr: *mut u8, len: usize) -> Result<ForeignRegion> {
        unsafe { self.rdma()?.registry.register(ptr, len) }
    }

    /// Ask the store for one remote block per key. `callback` gets the
    /// blocks in key order, or the store's status (e.g. `Retry`).
    pub fn allocate_rdma_async(
        &self,
        keys: &[String],
        block_size: u32,
        callback: Callback<Vec<RemoteBlock>>,
    ) -> Result<()> {
        let session = self.rdma()?;
        if keys.is_empty() {
            return Err(KvError::InvalidRequest("no keys to allocate".into()));
        }
        if block_size == 0 {
            return Err(KvError::InvalidRequest("block_size is 0".into()));
        }
        let req = Request::Allocate(RemoteMetaRequest {
            keys: keys.to_vec(),
            block_size,
            rkey: 0,
            remote_addrs: Vec::new(),
        });
        session.submit_message(
            &req,
            ResponseWaiter::Allocate {
                expected: keys.len(),
                callback,
            },
        )
    }

    pub fn allocate_rdma(&self, keys: &[String], block_size: u32) -> Result<Vec<RemoteBlock>> {
        let (tx, rx) = oneshot::channel();
        self.allocate_rdma_async(keys, block_size, reply_to(tx))?;
        wait(rx)
    }

    /// Have the store write each block's value into `base_ptr + offset`.
    /// Every destination must lie in one registered region.
    pub fn r_rdma_async(
        &self,
        blocks: &[Block],
        block_size: u32,
        base_ptr: u64,
        callback: Callback<()>,
    ) -> Result<()> {
        let session = self.rdma()?;
        if blocks.is_empty() {
            return Err(KvError::InvalidRequest("no blocks to read".into()));
        }
        if block_size == 0 {
            return Err(KvError::InvalidRequest("block_size is 0".into()));
        }
        let len = block_size as usize;
        let remote_addrs: Vec<u64> = blocks
            .iter()
            .map(|b| base_ptr.checked_add(b.offset))
            .collect::<Option<_>>()
            .ok_or_else(|| KvError::InvalidRequest("block offset overflows address".into()))?;

        let region = session.registry.lookup(remote_addrs[0], len)?;
        if let Some(addr) = remote_addrs.iter().find(|a| !region.contains(**a, len)) {
            return Err(KvError::NotRegistered { addr: *addr, len });
        }

        let req = Request::RdmaRead(RemoteMetaRequest {
            keys: blocks.iter().map(|b| b.key.clone()).collect(),
            block_size,
            rkey: region.rkey,
            remote_addrs,
        });
        session.submit_message(&req, ResponseWaiter::ReadAck { callback })
    }

    pub fn r_rdma(&self, blocks: &[Block], block_size: u32, base_ptr: u64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.r_rdma_async(blocks, block_size, base_ptr, reply_to(tx))?;
        wait(rx)
    }

    /// Write `block_size` bytes from each `base_ptr + offsets[i]` to
    /// `remote_blocks[i]`. `callback` runs once the whole batch is acked.
    pub fn w_rdma_async(
        &self,
        offsets: &[u64],
        block_size: u32,
        remote_blocks: &[RemoteBlock],
        base_ptr: u64,
        callback: Callback<()>,
    ) -> Result<()> {
        let session = self.rdma()?;
        if offsets.is_empty() {
            return Err(KvError::InvalidRequest("no blocks to write".into()));
        }
        if offsets.len() != remote_blocks.len() {
            return Err(KvError::InvalidRequest(format!(
                "{} offsets for {} remote blocks",
                offsets.len(),
                remote_blocks.len()
            )));
        }
        if offsets.len() > self.config.max_outstanding {
            return Err(KvError::InvalidRequest(format!(
                "write of {} blocks exceeds send queue of {}",
                offsets.len(),
                self.config.max_outstanding
            )));
        }
        if block_size == 0 {
            return Err(KvError::InvalidRequest("block_size is 0".into()));
        }

        let len = block_size as usize;
        let mut segments = Vec::with_capacity(offsets.len());
        for (offset, remote) in offsets.iter().zip(remote_blocks) {
            let local_addr = base_ptr
                .checked_add(*offset)
                .ok_or_else(|| KvError::InvalidRequest("block offset overflows address".into()))?;
            let region = session.registry.lookup(local_addr, len)?;
            segments.push(WriteSegment {
                local_addr,
                len: block_size,
                lkey: region.lkey,
                remote_addr: remote.remote_addr,
                rkey: remote.rkey,
            });
        }

        let wr_id = session.dispatcher.next_wr_id();
        let work = SendChain::write(wr_id, &segments);
        let remote_addrs = remote_blocks.iter().map(|b| b.remote_addr).collect();
        session.dispatcher.submit_write(work, remote_addrs, callback)
    }

    pub fn w_rdma(
        &self,
        offsets: &[u64],
        block_size: u32,
        remote_blocks: &[RemoteBlock],
        base_ptr: u64,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.w_rdma_async(offsets, block_size, remote_blocks, base_ptr, reply_to(tx))?;
        wait(rx)
    }

    /// Block until every accepted RDMA operation has settled.
    pub fn sync_rdma(&self) -> Result<()> {
        self.rdma()?.dispatcher.wait_idle()
    }

    /// [`sync_rdma`](Self::sync_rdma) with an upper bound. Returns whether
    /// everything settled in time.
    pub fn sync_rdma_timeout(&self, timeout: Duration) -> Result<bool> {
        self.rdma()?.dispatcher.wait_idle_timeout(timeout)
    }

    /// Send-queue slots currently reserved.
    pub fn outstanding(&self) -> usize {
        self.rdma.as_ref().map_or(0, |s| s.dispatcher.outstanding())
    }

    /// Accepted RDMA operations whose callback has not run.
    pub fn in_flight(&self) -> usize {
        self.rdma.as_ref().map_or(0, |s| s.dispatcher.in_flight())
    }

    /// Stop the completion thread, fail anything still outstanding with
    /// `ConnectionClosed`, and release RDMA and socket resources. Safe to
    /// call more than once.
    pub fn close_conn(&mut self) {
        if let Some(session) = self.rdma.take() {
            session.close();
        }
        if let Some(control) = self.control.take() {
            tracing::info!(peer = control.peer(), "connection closed");
            control.shutdown();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_conn();
    }
}

fn reply_to<T: Send + 'static>(tx: oneshot::Sender<Result<T>>) -> Callback<T> {
    Box::new(move |r: Result<T>| {
        let _ = tx.send(r);
    })
}

/// Block on a callback's result. Must not be called from an async context.
fn wait<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.blocking_recv().map_err(|_| KvError::ConnectionClosed)?
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("service", &self.config.service_addr())
            .field("control", &self.control.is_some())
            .field("rdma", &self.rdma.is_some())
            .finish()
    }
}
