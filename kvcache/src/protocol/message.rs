//! Typed message bodies.
//!
//! Variable-length bodies are msgpack arrays (`rmp-serde` compact form) so
//! field order is the schema. The handshake info and local results have a
//! fixed little-endian layout because they are read before anything else on
//! a fresh connection.

use crate::error::{KvError, Result};
use crate::types::{Block, RemoteBlock, Status};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Size of a CUDA IPC memory handle.
pub const IPC_HANDLE_SIZE: usize = 64;

/// Opaque inter-process memory handle, produced by the device runtime and
/// opened by the store on the same host.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcMemHandle(pub [u8; IPC_HANDLE_SIZE]);

impl IpcMemHandle {
    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for IpcMemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IpcMemHandle(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

impl Serialize for IpcMemHandle {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for IpcMemHandle {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(d)?;
        let raw: [u8; IPC_HANDLE_SIZE] = buf
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::invalid_length(buf.len(), &"a 64-byte IPC handle"))?;
        Ok(Self(raw))
    }
}

/// Body of a same-host `Read`/`Write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMeta {
    pub ipc_handle: IpcMemHandle,
    pub block_size: u32,
    pub blocks: Vec<Block>,
}

/// Body of an allocation (`RdmaWrite`) or `RdmaRead` request.
///
/// For allocation `rkey` is 0 and `remote_addrs` is empty. For a read they
/// name the client memory the store writes each key into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetaRequest {
    pub keys: Vec<String>,
    pub block_size: u32,
    pub rkey: u32,
    pub remote_addrs: Vec<u64>,
}

/// Allocation reply: one remote block per requested key, or an error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetaResponse {
    pub blocks: Vec<RemoteBlock>,
    pub error_code: u32,
}

impl RemoteMetaResponse {
    /// Blocks for `expected` keys, or the store's error. When `error_code` is
    /// non-zero none of the blocks are usable.
    pub fn into_blocks(self, expected: usize) -> Result<Vec<RemoteBlock>> {
        if self.error_code != 0 && self.error_code != Status::Finish.code() {
            return Err(match Status::from_code(self.error_code) {
                Some(status) => KvError::Status(status),
                None => KvError::UnknownStatus(self.error_code),
            });
        }
        if self.blocks.len() != expected {
            return Err(KvError::decode(format!(
                "allocation returned {} blocks for {expected} keys",
                self.blocks.len()
            )));
        }
        Ok(self.blocks)
    }
}

/// Body of `CheckExist`, `MatchLastIndex`, `DeleteKeys` and `TcpGet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysRequest {
    pub keys: Vec<String>,
}

/// Body of `TcpPut`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPayload {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

pub const CONN_INFO_SIZE: usize = 28;

/// Queue-pair handshake info.
///
/// ```text
/// [0..4]   qpn: u32 LE
/// [4..8]   psn: u32 LE
/// [8..24]  gid: [u8; 16]
/// [24..28] mtu: u32 LE (ibv_mtu enum value)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdmaConnInfo {
    pub qpn: u32,
    pub psn: u32,
    pub gid: [u8; 16],
    pub mtu: u32,
}

impl RdmaConnInfo {
    pub fn encode(&self) -> [u8; CONN_INFO_SIZE] {
        let mut buf = [0u8; CONN_INFO_SIZE];
        buf[0..4].copy_from_slice(&self.qpn.to_le_bytes());
        buf[4..8].copy_from_slice(&self.psn.to_le_bytes());
        buf[8..24].copy_from_slice(&self.gid);
        buf[24..28].copy_from_slice(&self.mtu.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != CONN_INFO_SIZE {
            return Err(KvError::decode(format!(
                "conn info must be {CONN_INFO_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[8..24]);
        Ok(Self {
            qpn: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            psn: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            gid,
            mtu: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }
}

pub const LOCAL_RESULT_SIZE: usize = 8;

/// Fixed reply to same-host and simple control requests: a status code
/// plus one integer whose meaning depends on the request (pending count for
/// `Sync`, match index, deleted count, existence flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalResult {
    pub code: u32,
    pub value: i32,
}

impl LocalResult {
    pub fn new(status: Status, value: i32) -> Self {
        Self {
            code: status.code(),
            value,
        }
    }

    pub fn encode(&self) -> [u8; LOCAL_RESULT_SIZE] {
        let mut buf = [0u8; LOCAL_RESULT_SIZE];
        buf[0..4].copy_from_slice(&self.code.to_le_bytes());
        buf[4..8].copy_from_slice(&self.value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != LOCAL_RESULT_SIZE {
            return Err(KvError::decode(format!(
                "local result must be {LOCAL_RESULT_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self {
            code: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            value: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    pub fn status(&self) -> Result<Status> {
        Status::from_code(self.code).ok_or(KvError::UnknownStatus(self.code))
    }

    /// `Ok(value)` when the store reports success, otherwise its status as an
    /// error.
    pub fn into_value(self) -> Result<i32> {
        let status = self.status()?;
        if status.is_success() {
            Ok(self.value)
        } else {
            Err(KvError::Status(status))
        }
    }
}

pub(crate) fn to_msgpack<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(KvError::encode)
}

/// Decode a msgpack body that must span all of `buf`.
pub(crate) fn from_msgpack<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    let mut cursor = std::io::Cursor::new(buf);
    let value = rmp_serde::from_read(&mut cursor).map_err(KvError::decode)?;
    if cursor.position() as usize != buf.len() {
        return Err(KvError::decode(format!(
            "{} trailing bytes after body",
            buf.len() - cursor.position() as usize
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> IpcMemHandle {
        let mut raw = [0u8; IPC_HANDLE_SIZE];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        IpcMemHandle(raw)
    }

    #[test]
    fn test_local_meta_msgpack() {
        let meta = LocalMeta {
            ipc_handle: handle(),
            block_size: 4096,
            blocks: vec![Block::new("a", 0), Block::new("b", 4096)],
        };
        let bytes = to_msgpack(&meta).unwrap();
        // fixarray of three fields
        assert_eq!(bytes[0], 0x93);
        let back: LocalMeta = from_msgpack(&bytes).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_ipc_handle_wrong_length() {
        let bytes = rmp_serde::to_vec(&(serde_bytes::Bytes::new(&[1u8; 10]),)).unwrap();
        let r: Result<(IpcMemHandle,)> = from_msgpack(&bytes);
        assert!(matches!(r, Err(KvError::DecodeFailed(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = to_msgpack(&KeysRequest {
            keys: vec!["k".into()],
        })
        .unwrap();
        bytes.push(0xc0);
        let r: Result<KeysRequest> = from_msgpack(&bytes);
        assert!(matches!(r, Err(KvError::DecodeFailed(_))));
    }

    #[test]
    fn test_conn_info_layout() {
        let info = RdmaConnInfo {
            qpn: 0x0102_0304,
            psn: 7,
            gid: [0xaa; 16],
            mtu: 5,
        };
        let buf = info.encode();
        assert_eq!(&buf[0..4], &[4, 3, 2, 1]);
        assert_eq!(&buf[8..24], &[0xaa; 16]);
        assert_eq!(RdmaConnInfo::decode(&buf).unwrap(), info);
        assert!(RdmaConnInfo::decode(&buf[..27]).is_err());
    }

    #[test]
    fn test_local_result_value() {
        assert_eq!(LocalResult::new(Status::Finish, 3).into_value().unwrap(), 3);
        assert!(matches!(
            LocalResult::new(Status::KeyNotFound, 0).into_value(),
            Err(KvError::Status(Status::KeyNotFound))
        ));
        let unknown = LocalResult { code: 1, value: 0 };
        assert!(matches!(
            unknown.into_value(),
            Err(KvError::UnknownStatus(1))
        ));
        let neg = LocalResult::new(Status::Finish, -1);
        assert_eq!(LocalResult::decode(&neg.encode()).unwrap(), neg);
    }

    #[test]
    fn test_remote_response_retry() {
        let resp = RemoteMetaResponse {
            blocks: vec![],
            error_code: Status::Retry.code(),
        };
        let err = resp.into_blocks(3).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_remote_response_count_mismatch() {
        let resp = RemoteMetaResponse {
            blocks: vec![RemoteBlock {
                rkey: 1,
                remote_addr: 2,
            }],
            error_code: 0,
        };
        assert!(matches!(
            resp.into_blocks(2),
            Err(KvError::DecodeFailed(_))
        ));
    }
}
