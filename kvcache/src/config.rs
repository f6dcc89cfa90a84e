//! Client configuration.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `KVCACHE_`) or by constructing a custom `ClientConfig`.

use crate::error::{KvError, Result};
use crate::types::{ConnectionType, LinkType};
use std::time::Duration;

/// Default TCP port of the store's control channel.
pub const DEFAULT_SERVICE_PORT: u16 = 22345;

/// Smallest scratch buffer that still holds a handshake frame and a
/// reasonably sized allocation response.
pub const MIN_SCRATCH_BUF_SIZE: usize = 4096;

/// Settings for one client-to-store session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Store host name or IP address.
    pub host_addr: String,

    /// Store control-channel port.
    pub service_port: u16,

    /// One of "debug", "info", "warning", "error".
    pub log_level: String,

    pub connection_type: ConnectionType,

    /// Only `Ethernet` (RoCEv2) is supported.
    pub link_type: LinkType,

    /// Physical port number on the RDMA device.
    pub ib_port: u8,

    /// RDMA device name (e.g. `mlx5_0`); the first device when unset.
    pub dev_name: Option<String>,

    /// GID table index; the first IPv4-mapped GID when unset.
    pub gid_index: Option<u32>,

    /// Send-queue capacity of the queue pair. Outstanding work requests never
    /// exceed this.
    pub max_outstanding: usize,

    /// Receive-queue depth. Also the size of each scratch pool.
    pub recv_depth: usize,

    /// Size of every send/receive scratch buffer.
    pub scratch_buf_size: usize,

    /// Delay between `Sync` polls in `sync_local`.
    pub sync_poll_interval: Duration,

    /// Upper bound on how long the completion thread sleeps before checking
    /// its stop flag.
    pub cq_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_addr: "127.0.0.1".to_string(),
            service_port: DEFAULT_SERVICE_PORT,
            log_level: "warning".to_string(),
            connection_type: ConnectionType::Rdma,
            link_type: LinkType::Ethernet,
            ib_port: 1,
            dev_name: None,
            gid_index: None,
            max_outstanding: 128,
            recv_depth: 32,
            scratch_buf_size: 64 * 1024, // 64 KiB
            sync_poll_interval: Duration::from_millis(1),
            cq_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `KVCACHE_HOST_ADDR`
    /// - `KVCACHE_SERVICE_PORT`
    /// - `KVCACHE_LOG_LEVEL`
    /// - `KVCACHE_CONNECTION_TYPE` (`rdma` or `tcp`)
    /// - `KVCACHE_LINK_TYPE` (`ethernet` or `ib`)
    /// - `KVCACHE_IB_PORT`
    /// - `KVCACHE_DEV_NAME`
    /// - `KVCACHE_GID_INDEX`
    /// - `KVCACHE_MAX_OUTSTANDING`
    /// - `KVCACHE_RECV_DEPTH`
    /// - `KVCACHE_SCRATCH_BUF_SIZE`
    /// - `KVCACHE_SYNC_POLL_INTERVAL_MS`
    /// - `KVCACHE_CQ_POLL_INTERVAL_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads from an arbitrary source.
    /// Unparseable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = lookup("KVCACHE_HOST_ADDR") {
            cfg.host_addr = v;
        }
        if let Some(v) = lookup("KVCACHE_SERVICE_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                cfg.service_port = p;
            }
        }
        if let Some(v) = lookup("KVCACHE_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Some(v) = lookup("KVCACHE_CONNECTION_TYPE") {
            match v.to_ascii_lowercase().as_str() {
                "rdma" => cfg.connection_type = ConnectionType::Rdma,
                "tcp" => cfg.connection_type = ConnectionType::Tcp,
                _ => {}
            }
        }
        if let Some(v) = lookup("KVCACHE_LINK_TYPE") {
            match v.to_ascii_lowercase().as_str() {
                "ethernet" => cfg.link_type = LinkType::Ethernet,
                "ib" => cfg.link_type = LinkType::Ib,
                _ => {}
            }
        }
        if let Some(v) = lookup("KVCACHE_IB_PORT") {
            if let Ok(p) = v.parse::<u8>() {
                cfg.ib_port = p;
            }
        }
        if let Some(v) = lookup("KVCACHE_DEV_NAME") {
            if !v.is_empty() {
                cfg.dev_name = Some(v);
            }
        }
        if let Some(v) = lookup("KVCACHE_GID_INDEX") {
            if let Ok(i) = v.parse::<u32>() {
                cfg.gid_index = Some(i);
            }
        }
        if let Some(v) = lookup("KVCACHE_MAX_OUTSTANDING") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_outstanding = n;
            }
        }
        if let Some(v) = lookup("KVCACHE_RECV_DEPTH") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.recv_depth = n;
            }
        }
        if let Some(v) = lookup("KVCACHE_SCRATCH_BUF_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.scratch_buf_size = n;
            }
        }
        if let Some(v) = lookup("KVCACHE_SYNC_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.sync_poll_interval = Duration::from_millis(ms);
            }
        }
        if let Some(v) = lookup("KVCACHE_CQ_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.cq_poll_interval = Duration::from_millis(ms);
            }
        }

        cfg
    }

    /// Reject settings the client cannot run with.
    pub fn verify(&self) -> Result<()> {
        if self.host_addr.is_empty() {
            return Err(KvError::Config("host_addr is empty".into()));
        }
        if self.service_port == 0 {
            return Err(KvError::Config("service_port must be non-zero".into()));
        }
        crate::logging::level_directive(&self.log_level)?;
        if self.connection_type == ConnectionType::Rdma {
            if self.link_type == LinkType::Ib {
                return Err(KvError::Config(
                    "InfiniBand link layer is not supported, use Ethernet (RoCEv2)".into(),
                ));
            }
            if self.ib_port == 0 {
                return Err(KvError::Config("ib_port must be non-zero".into()));
            }
        }
        if self.max_outstanding == 0 {
            return Err(KvError::Config("max_outstanding must be non-zero".into()));
        }
        if self.recv_depth == 0 {
            return Err(KvError::Config("recv_depth must be non-zero".into()));
        }
        if self.scratch_buf_size < MIN_SCRATCH_BUF_SIZE {
            return Err(KvError::Config(format!(
                "scratch_buf_size {} is below the minimum of {MIN_SCRATCH_BUF_SIZE}",
                self.scratch_buf_size
            )));
        }
        if self.scratch_buf_size > u32::MAX as usize {
            return Err(KvError::Config(format!(
                "scratch_buf_size {} does not fit a work request",
                self.scratch_buf_size
            )));
        }
        Ok(())
    }

    /// `host:port` of the control channel.
    pub fn service_addr(&self) -> String {
        format!("{}:{}", self.host_addr, self.service_port)
    }
}
