//! TCP control channel to the store.
//!
//! Carries the queue-pair handshake, same-host transfers, key queries and
//! small TCP values. Each call writes one framed request and reads exactly
//! one framed response; calls are serialized by a mutex so frames from
//! different threads never interleave.

use crate::config::ClientConfig;
use crate::error::{KvError, Result};
use crate::protocol::{
    IpcMemHandle, KeysRequest, LocalMeta, LocalResult, RdmaConnInfo, Request, Response,
    TcpPayload, read_frame, write_request,
};
use crate::types::{Block, LocalOp, Status};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct ControlChannel {
    stream: Mutex<TcpStream>,
    peer: String,
    /// Set once a frame could not be read whole; nothing after it can be
    /// trusted to line up with our requests.
    broken: AtomicBool,
}

impl ControlChannel {
    /// Connect to `host_addr:service_port`.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let addr = config.service_addr();
        let stream = TcpStream::connect(&addr).map_err(|e| {
            tracing::warn!(%addr, error = %e, "control channel connect failed");
            KvError::Io(e)
        })?;
        let channel = Self::from_stream(stream)?;
        tracing::info!(peer = %channel.peer, "control channel connected");
        Ok(channel)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        Ok(Self {
            stream: Mutex::new(stream),
            peer,
            broken: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// One request/response round trip.
    ///
    /// A response with an unknown kind or an undecodable body is rejected
    /// and the channel stays usable. Losing the framing itself (bad magic,
    /// oversized body, I/O failure) breaks the channel for good.
    pub fn call(&self, req: &Request) -> Result<Response> {
        if self.is_broken() {
            return Err(KvError::ConnectionBroken);
        }
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| KvError::LockPoisoned("control stream"))?;
        let frame = write_request(&mut *stream, req)
            .and_then(|_| read_frame(&mut *stream))
            .inspect_err(|e| {
                self.broken.store(true, Ordering::Release);
                tracing::error!(
                    peer = %self.peer,
                    op = ?req.opcode(),
                    error = %e,
                    "control channel out of sync"
                );
            })?;
        drop(stream);
        frame.into_response().inspect_err(|e| {
            tracing::warn!(op = ?req.opcode(), error = %e, "rejected malformed response");
        })
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn call_local(&self, req: &Request) -> Result<LocalResult> {
        match self.call(req)? {
            Response::Local(res) => Ok(res),
            other => Err(KvError::UnexpectedResponse {
                expected: "local",
                got: other.kind_name(),
            }),
        }
    }

    /// Queue a same-host copy between the caller's device memory (exported
    /// as `handle`) and the store. Completion is only guaranteed after
    /// [`sync_local`](Self::sync_local).
    pub fn rw_local(
        &self,
        op: LocalOp,
        blocks: Vec<Block>,
        block_size: u32,
        handle: IpcMemHandle,
    ) -> Result<()> {
        if blocks.is_empty() {
            return Err(KvError::InvalidRequest("no blocks to transfer".into()));
        }
        if block_size == 0 {
            return Err(KvError::InvalidRequest("block_size is 0".into()));
        }
        let meta = LocalMeta {
            ipc_handle: handle,
            block_size,
            blocks,
        };
        let req = match op {
            LocalOp::Read => Request::Read(meta),
            LocalOp::Write => Request::Write(meta),
        };
        self.call_local(&req)?.into_value()?;
        Ok(())
    }

    /// Poll until the store reports no pending same-host transfers.
    pub fn sync_local(&self, poll_interval: Duration) -> Result<()> {
        loop {
            let remain = self.call_local(&Request::Sync)?.into_value()?;
            if remain <= 0 {
                return Ok(());
            }
            tracing::trace!(remain, "local transfers pending");
            std::thread::sleep(poll_interval);
        }
    }

    /// Send our queue-pair info, receive the store's.
    pub fn exchange(&self, local: RdmaConnInfo) -> Result<RdmaConnInfo> {
        match self.call(&Request::Exchange(local))? {
            Response::Exchange {
                code,
                info: Some(remote),
            } if code == Status::Finish.code() => Ok(remote),
            Response::Exchange { code, .. } => Err(KvError::Handshake(format!(
                "store rejected queue-pair exchange with code {code}"
            ))),
            other => Err(KvError::UnexpectedResponse {
                expected: "exchange",
                got: other.kind_name(),
            }),
        }
    }

    pub fn check_exist(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Err(KvError::InvalidRequest("empty key".into()));
        }
        let res = self.call_local(&Request::CheckExist(KeysRequest {
            keys: vec![key.to_string()],
        }))?;
        match res.status()? {
            Status::KeyNotFound => Ok(false),
            _ => Ok(res.into_value()? != 0),
        }
    }

    /// Index of the last key in `keys` that the store holds, if any.
    pub fn get_match_last_index(&self, keys: &[String]) -> Result<Option<usize>> {
        if keys.is_empty() {
            return Err(KvError::InvalidRequest("no keys to match".into()));
        }
        let res = self.call_local(&Request::MatchLastIndex(KeysRequest {
            keys: keys.to_vec(),
        }))?;
        if res.status()? == Status::KeyNotFound {
            return Ok(None);
        }
        let idx = res.into_value()?;
        if idx < 0 {
            return Ok(None);
        }
        let idx = idx as usize;
        if idx >= keys.len() {
            return Err(KvError::decode(format!(
                "match index {idx} out of range for {} keys",
                keys.len()
            )));
        }
        Ok(Some(idx))
    }

    /// Delete `keys`, returning how many the store removed.
    pub fn delete_keys(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Err(KvError::InvalidRequest("no keys to delete".into()));
        }
        let res = self.call_local(&Request::DeleteKeys(KeysRequest {
            keys: keys.to_vec(),
        }))?;
        let deleted = res.into_value()?;
        usize::try_from(deleted)
            .map_err(|_| KvError::decode(format!("negative delete count {deleted}")))
    }

    /// Store a small value over TCP.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(KvError::InvalidRequest("empty key".into()));
        }
        self.call_local(&Request::TcpPut(TcpPayload {
            key: key.to_string(),
            value: value.to_vec(),
        }))?
        .into_value()?;
        Ok(())
    }

    /// Fetch a value stored with [`put`](Self::put).
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(KvError::InvalidRequest("empty key".into()));
        }
        match self.call(&Request::TcpGet(KeysRequest {
            keys: vec![key.to_string()],
        }))? {
            Response::Value(v) => Ok(v),
            Response::Local(res) => {
                res.into_value()?;
                Err(KvError::UnexpectedResponse {
                    expected: "value",
                    got: "local",
                })
            }
            other => Err(KvError::UnexpectedResponse {
                expected: "value",
                got: other.kind_name(),
            }),
        }
    }

    /// Close both directions of the socket.
    pub fn shutdown(&self) {
        if let Ok(stream) = self.stream.lock() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                tracing::debug!(peer = %self.peer, error = %e, "control channel shutdown");
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
