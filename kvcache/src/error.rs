use crate::types::Status;

pub type Result<T> = std::result::Result<T, KvError>;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("protocol mismatch: expected magic {expected:#010x}, got {got:#010x}")]
    ProtocolMismatch { expected: u32, got: u32 },

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unknown response kind {0}")]
    UnknownResponseKind(u8),

    #[error("unknown status code {0}")]
    UnknownStatus(u32),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("store returned {0}")]
    Status(Status),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    #[error("{0} pool exhausted")]
    PoolExhausted(&'static str),

    #[error("memory range {addr:#x}+{len} is not registered")]
    NotRegistered { addr: u64, len: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RDMA device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("RDMA handshake failed: {0}")]
    Handshake(String),

    #[error("work completion failed (wr_id={wr_id}, status={status}, vendor_err={vendor_err})")]
    WorkCompletion {
        wr_id: u64,
        status: u32,
        vendor_err: u32,
    },

    #[error("connection is broken after a fatal error")]
    ConnectionBroken,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("{0} channel is not connected")]
    NotConnected(&'static str),

    #[error("{0} is already initialized")]
    AlreadyInitialized(&'static str),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl KvError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn decode(msg: impl std::fmt::Display) -> Self {
        Self::DecodeFailed(msg.to_string())
    }

    pub fn encode(msg: impl std::fmt::Display) -> Self {
        Self::EncodeFailed(msg.to_string())
    }

    /// The store could not serve the request right now; the caller may resend it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Status(Status::Retry))
    }

    /// The connection can no longer be used and must be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Device { .. }
                | Self::Handshake(_)
                | Self::WorkCompletion { .. }
                | Self::ConnectionBroken
                | Self::ConnectionClosed
        )
    }
}
