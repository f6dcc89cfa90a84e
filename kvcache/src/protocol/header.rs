use crate::error::{KvError, Result};

/// Constant leading every frame. A peer sending anything else speaks a
/// different protocol.
pub const MAGIC: u32 = 0xdeadbeef;

/// Size of both request and response headers in bytes.
pub const HEADER_SIZE: usize = 9;

/// Request opcode, sent as a single ASCII character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Same-host read through an IPC memory handle.
    Read = b'R',
    /// Same-host write through an IPC memory handle.
    Write = b'W',
    /// Poll the store's queue of pending same-host transfers.
    Sync = b'S',
    /// Queue-pair handshake.
    RdmaExchange = b'E',
    /// Reserve remote blocks that the client will RDMA-write into.
    RdmaWrite = b'D',
    /// Ask the store to RDMA-write blocks into client memory.
    RdmaRead = b'A',
    CheckExist = b'C',
    MatchLastIndex = b'M',
    DeleteKeys = b'X',
    TcpPut = b'P',
    TcpGet = b'G',
}

impl OpCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            b'R' => Some(Self::Read),
            b'W' => Some(Self::Write),
            b'S' => Some(Self::Sync),
            b'E' => Some(Self::RdmaExchange),
            b'D' => Some(Self::RdmaWrite),
            b'A' => Some(Self::RdmaRead),
            b'C' => Some(Self::CheckExist),
            b'M' => Some(Self::MatchLastIndex),
            b'X' => Some(Self::DeleteKeys),
            b'P' => Some(Self::TcpPut),
            b'G' => Some(Self::TcpGet),
            _ => None,
        }
    }
}

/// Type tag of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseKind {
    /// Fixed `LocalResult` (status code plus one integer).
    Local = 0,
    /// Msgpack `RemoteMetaResponse`.
    Remote = 1,
    /// Status code followed by the peer's `RdmaConnInfo`.
    RemoteExchange = 2,
    /// Raw value bytes of a TCP get.
    Value = 3,
}

impl ResponseKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Local),
            1 => Some(Self::Remote),
            2 => Some(Self::RemoteExchange),
            3 => Some(Self::Value),
            _ => None,
        }
    }
}

/// 9-byte header in front of every request.
///
/// ```text
/// [0..4] magic: u32 LE (0xdeadbeef)
/// [4]    opcode: u8
/// [5..9] body_size: u32 LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub op: OpCode,
    pub body_size: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        encode_raw(self.op as u8, self.body_size)
    }

    /// Decode and validate a request header. The magic is checked before the
    /// opcode so a foreign peer is reported as such.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let (tag, body_size) = decode_raw(buf)?;
        let op = OpCode::from_u8(tag).ok_or(KvError::UnknownOpcode(tag))?;
        Ok(Self { op, body_size })
    }
}

/// 9-byte header in front of every response; same layout as [`Header`] with
/// the opcode byte replaced by a [`ResponseKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespHeader {
    pub kind: ResponseKind,
    pub body_size: u32,
}

impl RespHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        encode_raw(self.kind as u8, self.body_size)
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let (tag, body_size) = decode_raw(buf)?;
        let kind = ResponseKind::from_u8(tag).ok_or(KvError::UnknownResponseKind(tag))?;
        Ok(Self { kind, body_size })
    }
}

fn encode_raw(tag: u8, body_size: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    buf[4] = tag;
    buf[5..9].copy_from_slice(&body_size.to_le_bytes());
    buf
}

/// Check the magic and split a header into its tag and body size.
pub(crate) fn decode_raw(buf: &[u8; HEADER_SIZE]) -> Result<(u8, u32)> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(KvError::ProtocolMismatch {
            expected: MAGIC,
            got: magic,
        });
    }
    let body_size = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
    Ok((buf[4], body_size))
}
