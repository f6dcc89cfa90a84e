//! Work-request chains posted to the send queue.

use ibverbs_sys::{ibv_send_flags, ibv_wr_opcode};
use kvcache::{Weighted, WorkRequest};
use std::ptr;

/// One block of an RDMA write: local source and remote target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSegment {
    pub local_addr: u64,
    pub len: u32,
    pub lkey: u32,
    pub remote_addr: u64,
    pub rkey: u32,
}

/// A linked list of send work requests, posted with a single
/// `ibv_post_send`. Only the last request is signaled, and every request
/// carries the same `wr_id` so an error on any of them finds the chain's
/// context.
pub struct SendChain {
    wr_id: u64,
    wrs: Vec<ibverbs_sys::ibv_send_wr>,
    sges: Vec<ibverbs_sys::ibv_sge>,
}

// The raw pointers inside the work requests only ever point into `sges`,
// which the chain owns.
unsafe impl Send for SendChain {}

impl SendChain {
    /// A signaled SEND of `len` bytes from a registered scratch buffer.
    pub fn send(wr_id: u64, addr: u64, len: u32, lkey: u32) -> Self {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = addr;
            sge.length = len;
            sge.lkey = lkey;

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.num_sge = 1;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

            Self {
                wr_id,
                wrs: vec![wr],
                sges: vec![sge],
            }
        }
    }

    /// One RDMA WRITE per segment. The last one is `WRITE_WITH_IMM`
    /// carrying the block count, so the store learns when the whole batch
    /// has landed.
    pub fn write(wr_id: u64, segments: &[WriteSegment]) -> Self {
        let n = segments.len();
        let mut wrs = Vec::with_capacity(n);
        let mut sges = Vec::with_capacity(n);
        for (i, seg) in segments.iter().enumerate() {
            unsafe {
                let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
                sge.addr = seg.local_addr;
                sge.length = seg.len;
                sge.lkey = seg.lkey;

                let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
                wr.wr_id = wr_id;
                wr.num_sge = 1;
                wr.wr.rdma.remote_addr = seg.remote_addr;
                wr.wr.rdma.rkey = seg.rkey;
                if i + 1 == n {
                    wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
                    wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
                    wr.__bindgen_anon_1.imm_data = (n as u32).to_be();
                } else {
                    wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
                }
                sges.push(sge);
                wrs.push(wr);
            }
        }
        Self { wr_id, wrs, sges }
    }

    pub fn len(&self) -> usize {
        self.wrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrs.is_empty()
    }

    /// Wire up `sg_list` and `next` pointers and return the list head.
    /// Must be called right before posting; the chain must not move until
    /// the post returns.
    pub(crate) fn link(&mut self) -> *mut ibverbs_sys::ibv_send_wr {
        let n = self.wrs.len();
        let sges = self.sges.as_mut_ptr();
        let wrs = self.wrs.as_mut_ptr();
        for i in 0..n {
            unsafe {
                let wr = &mut *wrs.add(i);
                wr.sg_list = sges.add(i);
                wr.next = if i + 1 < n { wrs.add(i + 1) } else { ptr::null_mut() };
            }
        }
        if n == 0 { ptr::null_mut() } else { wrs }
    }

    #[cfg(test)]
    pub(crate) fn wrs(&self) -> &[ibverbs_sys::ibv_send_wr] {
        &self.wrs
    }
}

impl Weighted for SendChain {
    fn weight(&self) -> usize {
        self.wrs.len()
    }
}

impl WorkRequest for SendChain {
    fn wr_id(&self) -> u64 {
        self.wr_id
    }
}

impl std::fmt::Debug for SendChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendChain")
            .field("wr_id", &self.wr_id)
            .field("len", &self.wrs.len())
            .finish()
    }
}
