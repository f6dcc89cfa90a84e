use crate::error::{KvError, Result};
use crate::protocol::header::{
    HEADER_SIZE, Header, OpCode, RespHeader, ResponseKind, decode_raw,
};
use crate::protocol::message::{
    CONN_INFO_SIZE, KeysRequest, LocalMeta, LocalResult, RdmaConnInfo, RemoteMetaRequest,
    RemoteMetaResponse, TcpPayload, from_msgpack, to_msgpack,
};
use std::io::{Read, Write};

/// Bodies larger than this are refused when reading, before any allocation.
pub const MAX_BODY_SIZE: u32 = 256 * 1024 * 1024;

/// A request as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read(LocalMeta),
    Write(LocalMeta),
    Sync,
    Exchange(RdmaConnInfo),
    Allocate(RemoteMetaRequest),
    RdmaRead(RemoteMetaRequest),
    CheckExist(KeysRequest),
    MatchLastIndex(KeysRequest),
    DeleteKeys(KeysRequest),
    TcpPut(TcpPayload),
    TcpGet(KeysRequest),
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::Read(_) => OpCode::Read,
            Self::Write(_) => OpCode::Write,
            Self::Sync => OpCode::Sync,
            Self::Exchange(_) => OpCode::RdmaExchange,
            Self::Allocate(_) => OpCode::RdmaWrite,
            Self::RdmaRead(_) => OpCode::RdmaRead,
            Self::CheckExist(_) => OpCode::CheckExist,
            Self::MatchLastIndex(_) => OpCode::MatchLastIndex,
            Self::DeleteKeys(_) => OpCode::DeleteKeys,
            Self::TcpPut(_) => OpCode::TcpPut,
            Self::TcpGet(_) => OpCode::TcpGet,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Self::Read(meta) | Self::Write(meta) => to_msgpack(meta),
            Self::Sync => Ok(Vec::new()),
            Self::Exchange(info) => Ok(info.encode().to_vec()),
            Self::Allocate(req) | Self::RdmaRead(req) => to_msgpack(req),
            Self::CheckExist(req)
            | Self::MatchLastIndex(req)
            | Self::DeleteKeys(req)
            | Self::TcpGet(req) => to_msgpack(req),
            Self::TcpPut(payload) => to_msgpack(payload),
        }
    }

    fn decode_body(op: OpCode, body: &[u8]) -> Result<Self> {
        Ok(match op {
            OpCode::Read => Self::Read(from_msgpack(body)?),
            OpCode::Write => Self::Write(from_msgpack(body)?),
            OpCode::Sync => {
                if !body.is_empty() {
                    return Err(KvError::decode("sync carries no body"));
                }
                Self::Sync
            }
            OpCode::RdmaExchange => Self::Exchange(RdmaConnInfo::decode(body)?),
            OpCode::RdmaWrite => Self::Allocate(from_msgpack(body)?),
            OpCode::RdmaRead => Self::RdmaRead(from_msgpack(body)?),
            OpCode::CheckExist => Self::CheckExist(from_msgpack(body)?),
            OpCode::MatchLastIndex => Self::MatchLastIndex(from_msgpack(body)?),
            OpCode::DeleteKeys => Self::DeleteKeys(from_msgpack(body)?),
            OpCode::TcpPut => Self::TcpPut(from_msgpack(body)?),
            OpCode::TcpGet => Self::TcpGet(from_msgpack(body)?),
        })
    }
}

/// A response as sent by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Local(LocalResult),
    Remote(RemoteMetaResponse),
    /// Handshake reply. `info` is present only when `code` is a success.
    Exchange {
        code: u32,
        info: Option<RdmaConnInfo>,
    },
    Value(Vec<u8>),
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::Local(_) => ResponseKind::Local,
            Self::Remote(_) => ResponseKind::Remote,
            Self::Exchange { .. } => ResponseKind::RemoteExchange,
            Self::Value(_) => ResponseKind::Value,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
            Self::Exchange { .. } => "exchange",
            Self::Value(_) => "value",
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Self::Local(res) => Ok(res.encode().to_vec()),
            Self::Remote(resp) => to_msgpack(resp),
            Self::Exchange { code, info } => {
                let mut body = code.to_le_bytes().to_vec();
                if let Some(info) = info {
                    body.extend_from_slice(&info.encode());
                }
                Ok(body)
            }
            Self::Value(v) => Ok(v.clone()),
        }
    }

    fn decode_body(kind: ResponseKind, body: &[u8]) -> Result<Self> {
        Ok(match kind {
            ResponseKind::Local => Self::Local(LocalResult::decode(body)?),
            ResponseKind::Remote => Self::Remote(from_msgpack(body)?),
            ResponseKind::RemoteExchange => {
                if body.len() != 4 && body.len() != 4 + CONN_INFO_SIZE {
                    return Err(KvError::decode(format!(
                        "exchange reply of {} bytes",
                        body.len()
                    )));
                }
                let code = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let info = if body.len() > 4 {
                    Some(RdmaConnInfo::decode(&body[4..])?)
                } else {
                    None
                };
                Self::Exchange { code, info }
            }
            ResponseKind::Value => Self::Value(body.to_vec()),
        })
    }
}

fn frame(header: [u8; HEADER_SIZE], body: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&body);
    buf
}

fn body_size(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        KvError::encode(format!(
            "payload too large for framed header: {len} bytes exceeds u32::MAX"
        ))
    })
}

/// Encode a request into `[header][body]`.
pub fn encode_request(req: &Request) -> Result<Vec<u8>> {
    let body = req.encode_body()?;
    let header = Header {
        op: req.opcode(),
        body_size: body_size(body.len())?,
    };
    Ok(frame(header.encode(), body))
}

/// Encode a response into `[header][body]`.
pub fn encode_response(resp: &Response) -> Result<Vec<u8>> {
    let body = resp.encode_body()?;
    let header = RespHeader {
        kind: resp.kind(),
        body_size: body_size(body.len())?,
    };
    Ok(frame(header.encode(), body))
}

/// Encode a request straight into a scratch buffer, returning the frame length.
pub fn encode_request_into(req: &Request, dst: &mut [u8]) -> Result<usize> {
    let bytes = encode_request(req)?;
    if bytes.len() > dst.len() {
        return Err(KvError::encode(format!(
            "{:?} frame of {} bytes exceeds scratch buffer of {}",
            req.opcode(),
            bytes.len(),
            dst.len()
        )));
    }
    dst[..bytes.len()].copy_from_slice(&bytes);
    Ok(bytes.len())
}

fn split_frame(buf: &[u8]) -> Result<(&[u8; HEADER_SIZE], &[u8])> {
    if buf.len() < HEADER_SIZE {
        return Err(KvError::decode(format!(
            "buffer too short: {} < {HEADER_SIZE}",
            buf.len()
        )));
    }
    let header: &[u8; HEADER_SIZE] = buf[..HEADER_SIZE]
        .try_into()
        .map_err(|_| KvError::decode("header slice length mismatch"))?;
    Ok((header, &buf[HEADER_SIZE..]))
}

fn exact_body(rest: &[u8], body_size: u32) -> Result<&[u8]> {
    let n = body_size as usize;
    if rest.len() < n {
        return Err(KvError::decode(format!(
            "buffer too short for body: {} < {n}",
            rest.len()
        )));
    }
    if rest.len() > n {
        return Err(KvError::decode(format!(
            "{} bytes beyond declared body size {n}",
            rest.len() - n
        )));
    }
    Ok(rest)
}

/// Decode one complete request frame.
pub fn decode_request(buf: &[u8]) -> Result<Request> {
    let (header, rest) = split_frame(buf)?;
    let header = Header::decode(header)?;
    Request::decode_body(header.op, exact_body(rest, header.body_size)?)
}

/// Decode one complete response frame, e.g. the filled prefix of a receive
/// buffer.
pub fn decode_response(buf: &[u8]) -> Result<Response> {
    let (header, rest) = split_frame(buf)?;
    let header = RespHeader::decode(header)?;
    Response::decode_body(header.kind, exact_body(rest, header.body_size)?)
}

fn read_body(r: &mut impl Read, body_size: u32) -> Result<Vec<u8>> {
    if body_size > MAX_BODY_SIZE {
        return Err(KvError::decode(format!(
            "declared body of {body_size} bytes exceeds limit of {MAX_BODY_SIZE}"
        )));
    }
    let mut body = vec![0u8; body_size as usize];
    r.read_exact(&mut body)?;
    Ok(body)
}

/// One frame taken off a stream with only its magic checked. Reading it
/// consumes exactly `body_size` bytes, so the stream sits at the next frame
/// boundary even when the tag turns out to be unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl RawFrame {
    pub fn into_request(self) -> Result<Request> {
        let op = OpCode::from_u8(self.tag).ok_or(KvError::UnknownOpcode(self.tag))?;
        Request::decode_body(op, &self.body)
    }

    pub fn into_response(self) -> Result<Response> {
        let kind =
            ResponseKind::from_u8(self.tag).ok_or(KvError::UnknownResponseKind(self.tag))?;
        Response::decode_body(kind, &self.body)
    }
}

/// Read one frame. A bad magic or an oversized body is returned before the
/// body is touched; after such an error the stream's framing is lost.
pub fn read_frame(r: &mut impl Read) -> Result<RawFrame> {
    let mut header = [0u8; HEADER_SIZE];
    r.read_exact(&mut header)?;
    let (tag, body_size) = decode_raw(&header)?;
    let body = read_body(r, body_size)?;
    Ok(RawFrame { tag, body })
}

/// Read exactly one request from a stream.
pub fn read_request(r: &mut impl Read) -> Result<Request> {
    read_frame(r)?.into_request()
}

/// Read exactly one response from a stream.
pub fn read_response(r: &mut impl Read) -> Result<Response> {
    read_frame(r)?.into_response()
}

pub fn write_request(w: &mut impl Write, req: &Request) -> Result<()> {
    w.write_all(&encode_request(req)?)?;
    w.flush()?;
    Ok(())
}

pub fn write_response(w: &mut impl Write, resp: &Response) -> Result<()> {
    w.write_all(&encode_response(resp)?)?;
    w.flush()?;
    Ok(())
}
