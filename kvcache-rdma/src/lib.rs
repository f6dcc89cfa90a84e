//! RoCEv2 transport for the kvcache client.
//!
//! [`Connection`] is the entry point: it owns the TCP control channel and,
//! after [`Connection::setup_rdma`], one reliable-connected queue pair whose
//! completions are drained by a dedicated thread ([`CompletionEngine`]).
//!
//! ```no_run
//! use kvcache::{Block, ClientConfig};
//! use kvcache_rdma::Connection;
//!
//! # fn main() -> kvcache::Result<()> {
//! let mut conn = Connection::new(ClientConfig::from_env())?;
//! conn.init_connection()?;
//! conn.setup_rdma()?;
//!
//! let mut buf = vec![0u8; 4 * 4096];
//! unsafe { conn.register_mr(buf.as_mut_ptr(), buf.len())? };
//!
//! let keys = vec!["k0".to_string(), "k1".to_string()];
//! let remote = conn.allocate_rdma(&keys, 4096)?;
//! conn.w_rdma(&[0, 4096], 4096, &remote, buf.as_ptr() as u64)?;
//!
//! let blocks = vec![Block::new("k0", 8192), Block::new("k1", 12288)];
//! conn.r_rdma(&blocks, 4096, buf.as_ptr() as u64)?;
//! conn.sync_rdma()?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod engine;
pub mod rdma;

pub use connection::Connection;
#[cfg(feature = "cuda")]
pub use cuda::CudaIpc;
pub use engine::CompletionEngine;
pub use rdma::{
    ForeignRegion, MrRegistry, PortInfo, QueuePair, RdmaContext, RegionIndex, RegisteredBuffer,
    SendChain, WriteSegment, device_names,
};
