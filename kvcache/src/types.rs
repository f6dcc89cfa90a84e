use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of cached data on the local side: store key plus byte offset into
/// the caller's buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub key: String,
    pub offset: u64,
}

impl Block {
    pub fn new(key: impl Into<String>, offset: u64) -> Self {
        Self {
            key: key.into(),
            offset,
        }
    }
}

/// The RDMA target of a block inside the store's registered memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteBlock {
    pub rkey: u32,
    pub remote_addr: u64,
}

/// Status codes carried in response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Finish = 200,
    TaskAccepted = 202,
    InvalidRequest = 400,
    KeyNotFound = 404,
    Retry = 408,
    InternalError = 500,
    SystemError = 503,
}

impl Status {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            200 => Some(Self::Finish),
            202 => Some(Self::TaskAccepted),
            400 => Some(Self::InvalidRequest),
            404 => Some(Self::KeyNotFound),
            408 => Some(Self::Retry),
            500 => Some(Self::InternalError),
            503 => Some(Self::SystemError),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Finish | Self::TaskAccepted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finish => "FINISH",
            Self::TaskAccepted => "TASK_ACCEPTED",
            Self::InvalidRequest => "INVALID_REQ",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::Retry => "RETRY",
            Self::InternalError => "INTERNAL_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Which transport carries bulk data for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    Rdma,
    Tcp,
}

/// Link layer of the RDMA port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkType {
    #[default]
    Ethernet,
    Ib,
}

/// Direction of a same-host transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOp {
    /// Store to client.
    Read,
    /// Client to store.
    Write,
}
