//! Reliable-connected queue pair and its INIT → RTR → RTS handshake.

use super::context::RdmaContext;
use super::mr::RegisteredBuffer;
use super::work::SendChain;
use ibverbs_sys::{ibv_access_flags, ibv_qp_attr_mask, ibv_qp_state};
use kvcache::protocol::RdmaConnInfo;
use kvcache::{KvError, Poster, Result};
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// An RC queue pair bound to the context's CQ for both directions.
pub struct QueuePair {
    qp: *mut ibverbs_sys::ibv_qp,
    psn: u32,
    ctx: Arc<RdmaContext>,
}

unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl QueuePair {
    /// Create the queue pair and move it to INIT.
    pub fn create(ctx: &Arc<RdmaContext>, max_send_wr: u32, max_recv_wr: u32) -> Result<Self> {
        let qp = unsafe {
            let mut init_attr: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init_attr.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_RC;
            init_attr.send_cq = ctx.cq();
            init_attr.recv_cq = ctx.cq();
            init_attr.cap.max_send_wr = max_send_wr;
            init_attr.cap.max_recv_wr = max_recv_wr;
            init_attr.cap.max_send_sge = 1;
            init_attr.cap.max_recv_sge = 1;
            ibverbs_sys::ibv_create_qp(ctx.pd(), &mut init_attr)
        };
        if qp.is_null() {
            return Err(KvError::device_with_source(
                format!("ibv_create_qp(send {max_send_wr}, recv {max_recv_wr}) failed"),
                std::io::Error::last_os_error(),
            ));
        }
        let qp = Self {
            qp,
            psn: initial_psn(),
            ctx: Arc::clone(ctx),
        };

        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = ctx.ib_port();
            attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
                .0;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            qp.modify(&mut attr, mask, "INIT")?;
        }
        tracing::debug!(qpn = qp.qp_num(), psn = qp.psn, "queue pair created");
        Ok(qp)
    }

    pub fn qp_num(&self) -> u32 {
        unsafe { (*self.qp).qp_num }
    }

    /// What we send to the store in the handshake.
    pub fn local_info(&self) -> RdmaConnInfo {
        RdmaConnInfo {
            qpn: self.qp_num(),
            psn: self.psn,
            gid: self.ctx.gid(),
            mtu: self.ctx.port().active_mtu,
        }
    }

    /// Bring the queue pair to RTS against the store's endpoint. The path
    /// MTU is the smaller of the two sides.
    pub fn connect(&self, remote: &RdmaConnInfo) -> Result<()> {
        let mtu = self.ctx.port().active_mtu.min(remote.mtu);
        unsafe {
            // INIT → RTR
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = mtu as _;
            attr.dest_qp_num = remote.qpn;
            attr.rq_psn = remote.psn;
            attr.max_dest_rd_atomic = 4;
            attr.min_rnr_timer = 12;

            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.gid;
            attr.ah_attr.grh.sgid_index = self.ctx.gid_index();
            attr.ah_attr.grh.hop_limit = 64;
            attr.ah_attr.grh.traffic_class = 0;
            attr.ah_attr.dlid = 0;
            attr.ah_attr.sl = 0;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = self.ctx.ib_port();

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
            self.modify(&mut attr, mask, "RTR")?;

            // RTR → RTS
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = self.psn;
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = 4;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
            self.modify(&mut attr, mask, "RTS")?;
        }
        tracing::info!(
            qpn = self.qp_num(),
            remote_qpn = remote.qpn,
            path_mtu = mtu,
            "queue pair ready"
        );
        Ok(())
    }

    unsafe fn modify(
        &self,
        attr: &mut ibverbs_sys::ibv_qp_attr,
        mask: ibv_qp_attr_mask,
        state: &str,
    ) -> Result<()> {
        let rc = unsafe { ibverbs_sys::ibv_modify_qp(self.qp, attr, mask.0 as c_int) };
        if rc != 0 {
            return Err(KvError::Handshake(format!(
                "ibv_modify_qp to {state} failed (rc={rc}, errno={})",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Poster for QueuePair {
    type Buf = RegisteredBuffer;
    type Work = SendChain;

    fn post_send(&self, work: &mut SendChain) -> Result<()> {
        let head = work.link();
        if head.is_null() {
            return Err(KvError::InvalidRequest("empty work request chain".into()));
        }
        let rc = unsafe {
            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            ops.post_send.as_mut().expect("post_send missing")(
                self.qp,
                head,
                &mut bad_wr as *mut _,
            )
        };
        if rc != 0 {
            return Err(KvError::device(format!(
                "post_send of {} work requests failed (rc={rc})",
                work.len()
            )));
        }
        Ok(())
    }

    fn post_recv(&self, wr_id: u64, buf: &RegisteredBuffer) -> Result<()> {
        let rc = unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = buf.addr();
            sge.length = buf.len() as u32;
            sge.lkey = buf.lkey();

            let mut wr: ibverbs_sys::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            ops.post_recv.as_mut().expect("post_recv missing")(
                self.qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            )
        };
        if rc != 0 {
            return Err(KvError::device(format!("post_recv failed (rc={rc})")));
        }
        Ok(())
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                let rc = ibverbs_sys::ibv_destroy_qp(self.qp);
                if rc != 0 {
                    tracing::warn!(rc, "ibv_destroy_qp failed");
                }
                self.qp = ptr::null_mut();
            }
        }
    }
}

/// Random 24-bit starting packet sequence number.
fn initial_psn() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos ^ std::process::id().rotate_left(8)) & 0x00ff_ffff
}
