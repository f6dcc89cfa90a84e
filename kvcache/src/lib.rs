//! Client data-movement core for a distributed KV-cache store.
//!
//! This crate holds everything that does not touch RDMA hardware: the wire
//! protocol, scratch-buffer pools, send-queue throttling, completion
//! dispatch and the TCP control channel. The `kvcache-rdma` crate plugs an
//! ibverbs queue pair into [`Dispatcher`] through the [`Poster`] trait.

pub mod completion;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod throttle;
pub mod types;

pub use completion::{Callback, ResponseWaiter, WcStatus, WorkCompletion, WrContext};
pub use config::ClientConfig;
pub use control::ControlChannel;
pub use dispatch::{Dispatcher, Poster, WorkRequest};
pub use error::{KvError, Result};
pub use pool::{Pooled, ScratchPool};
pub use throttle::{Admission, Throttler, Weighted};
pub use types::{Block, ConnectionType, LinkType, LocalOp, RemoteBlock, Status};
