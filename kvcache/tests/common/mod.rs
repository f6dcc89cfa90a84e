//! Shared test fixtures: an in-memory NIC for the dispatcher and an
//! in-process fake store for the control channel.

#![allow(dead_code)]

use kvcache::completion::WorkCompletion;
use kvcache::protocol::{Request, Response, encode_request_into, encode_response, read_request};
use kvcache::{
    Callback, Dispatcher, KvError, Poster, ResponseWaiter, ScratchPool, Weighted, WorkRequest,
};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub const BUF_SIZE: usize = 4096;

// ── Mock NIC ────────────────────────────────────────────────────────

/// Scratch buffer the mock NIC can write into behind the dispatcher's back,
/// the way a real NIC fills a posted receive.
pub struct MockBuf {
    cell: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for MockBuf {}
unsafe impl Sync for MockBuf {}

impl MockBuf {
    pub fn new(size: usize) -> Self {
        Self {
            cell: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    fn raw(&self) -> (usize, usize) {
        unsafe {
            let data = &mut *self.cell.get();
            (data.as_mut_ptr() as usize, data.len())
        }
    }

    pub fn fill(&mut self, f: impl FnOnce(&mut [u8]) -> usize) -> usize {
        f(self.cell.get_mut())
    }
}

impl AsRef<[u8]> for MockBuf {
    fn as_ref(&self) -> &[u8] {
        unsafe { &*self.cell.get() }
    }
}

#[derive(Debug)]
pub struct MockWork {
    pub wr_id: u64,
    pub weight: usize,
    pub tag: u32,
}

impl Weighted for MockWork {
    fn weight(&self) -> usize {
        self.weight
    }
}

impl WorkRequest for MockWork {
    fn wr_id(&self) -> u64 {
        self.wr_id
    }
}

#[derive(Default)]
pub struct MockNic {
    /// `(wr_id, tag)` in the order they reached the "wire".
    pub sends: Mutex<Vec<(u64, u32)>>,
    /// Posted receives, oldest first: `(wr_id, addr, len)`.
    pub recvs: Mutex<VecDeque<(u64, usize, usize)>>,
    pub fail_sends: AtomicBool,
    /// Forwarded wr_ids for a simulated hardware thread.
    pub wire: Mutex<Option<mpsc::Sender<u64>>>,
}

impl Poster for MockNic {
    type Buf = MockBuf;
    type Work = MockWork;

    fn post_send(&self, work: &mut MockWork) -> kvcache::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(KvError::device("mock post_send failure"));
        }
        self.sends.lock().unwrap().push((work.wr_id, work.tag));
        if let Some(tx) = self.wire.lock().unwrap().as_ref() {
            let _ = tx.send(work.wr_id);
        }
        Ok(())
    }

    fn post_recv(&self, wr_id: u64, buf: &MockBuf) -> kvcache::Result<()> {
        let (addr, len) = buf.raw();
        self.recvs.lock().unwrap().push_back((wr_id, addr, len));
        Ok(())
    }
}

impl MockNic {
    pub fn sent_tags(&self) -> Vec<u32> {
        self.sends.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn sent_ids(&self) -> Vec<u64> {
        self.sends.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn posted_recvs(&self) -> usize {
        self.recvs.lock().unwrap().len()
    }
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher<MockNic>>,
    pub send_pool: Arc<ScratchPool<MockBuf>>,
}

pub fn harness(capacity: usize, depth: usize) -> Harness {
    let recv_pool = ScratchPool::new("recv", (0..depth).map(|_| MockBuf::new(BUF_SIZE)).collect());
    let send_pool = ScratchPool::new("send", (0..depth).map(|_| MockBuf::new(BUF_SIZE)).collect());
    let dispatcher = Arc::new(Dispatcher::new(MockNic::default(), capacity, recv_pool));
    dispatcher.prime_receives().unwrap();
    Harness {
        dispatcher,
        send_pool,
    }
}

impl Harness {
    pub fn nic(&self) -> &MockNic {
        self.dispatcher.poster()
    }

    /// Frame `req` into a send buffer and submit it with `waiter`.
    pub fn submit_message(
        &self,
        req: &Request,
        tag: u32,
        waiter: ResponseWaiter,
    ) -> kvcache::Result<u64> {
        let mut buf = self
            .send_pool
            .acquire()
            .ok_or(KvError::PoolExhausted("send"))?;
        buf.fill(|dst| encode_request_into(req, dst).unwrap());
        let wr_id = self.dispatcher.next_wr_id();
        let work = MockWork {
            wr_id,
            weight: 1,
            tag,
        };
        self.dispatcher.submit_message(work, buf, waiter)?;
        Ok(wr_id)
    }

    pub fn submit_write(
        &self,
        blocks: usize,
        tag: u32,
        callback: Callback<()>,
    ) -> kvcache::Result<u64> {
        let wr_id = self.dispatcher.next_wr_id();
        let work = MockWork {
            wr_id,
            weight: blocks,
            tag,
        };
        let remote_addrs = (0..blocks as u64).map(|i| 0x10_0000 + i * 4096).collect();
        self.dispatcher.submit_write(work, remote_addrs, callback)?;
        Ok(wr_id)
    }

    pub fn complete_ok(&self, wr_id: u64) {
        self.dispatcher
            .complete(WorkCompletion::success(wr_id, 0))
            .unwrap();
    }

    /// Write `resp` into the oldest posted receive and complete it.
    pub fn deliver(&self, resp: &Response) {
        let frame = encode_response(resp).unwrap();
        let (wr_id, addr, len) = self
            .nic()
            .recvs
            .lock()
            .unwrap()
            .pop_front()
            .expect("no receive posted");
        assert!(frame.len() <= len);
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), addr as *mut u8, frame.len());
        }
        self.dispatcher
            .complete(WorkCompletion::success(wr_id, frame.len()))
            .unwrap();
    }
}

/// Records how a callback was settled.
#[derive(Clone, Default)]
pub struct Outcomes {
    pub ok: Arc<AtomicUsize>,
    pub err: Arc<AtomicUsize>,
    pub errors: Arc<Mutex<Vec<String>>>,
}

impl Outcomes {
    pub fn callback<T: Send + 'static>(&self) -> Callback<T> {
        let this = self.clone();
        Box::new(move |r: kvcache::Result<T>| match r {
            Ok(_) => {
                this.ok.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                this.err.fetch_add(1, Ordering::SeqCst);
                this.errors.lock().unwrap().push(e.to_string());
            }
        })
    }

    pub fn ok(&self) -> usize {
        self.ok.load(Ordering::SeqCst)
    }

    pub fn err(&self) -> usize {
        self.err.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.ok() + self.err()
    }
}

// ── Fake store ──────────────────────────────────────────────────────

/// Serves one connection, answering each request with the raw bytes the
/// handler returns.
pub struct FakeStore {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<Request>>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeStore {
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Vec<u8> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = match listener.accept() {
                Ok(s) => s,
                Err(_) => return,
            };
            while let Ok(req) = read_request(&mut stream) {
                let reply = handler(&req);
                seen2.lock().unwrap().push(req);
                if stream.write_all(&reply).is_err() {
                    break;
                }
            }
        });
        Self {
            addr,
            seen,
            handle: Some(handle),
        }
    }

    /// A store that answers every request with a well-formed response.
    pub fn responding<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Response + Send + 'static,
    {
        Self::spawn(move |req| encode_response(&handler(req)).unwrap())
    }

    pub fn requests(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }

    pub fn config(&self) -> kvcache::ClientConfig {
        kvcache::ClientConfig {
            host_addr: self.addr.ip().to_string(),
            service_port: self.addr.port(),
            connection_type: kvcache::ConnectionType::Tcp,
            ..kvcache::ClientConfig::default()
        }
    }

    pub fn join(mut self) {
        if let Some(h) = self.handle.take() {
            h.join().unwrap();
        }
    }
}
