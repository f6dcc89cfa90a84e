//! Session lifecycle of `Connection`. The RDMA path needs a NIC and is
//! skipped when the host has none.

use kvcache::protocol::{LocalResult, Request, Response, encode_response, read_request};
use kvcache::{Block, ClientConfig, ConnectionType, KvError, RemoteBlock, Status};
use kvcache_rdma::{Connection, MrRegistry, QueuePair, RdmaContext, RegisteredBuffer};
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A store speaking only the TCP-side operations, for one connection.
fn spawn_store() -> (ClientConfig, JoinHandle<Vec<Request>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let mut seen = Vec::new();
        let mut values: HashMap<String, Vec<u8>> = HashMap::new();
        let Ok((mut stream, _)) = listener.accept() else {
            return seen;
        };
        while let Ok(req) = read_request(&mut stream) {
            let resp = match &req {
                Request::TcpPut(p) => {
                    values.insert(p.key.clone(), p.value.clone());
                    Response::Local(LocalResult::new(Status::Finish, 0))
                }
                Request::TcpGet(k) => match values.get(&k.keys[0]) {
                    Some(v) => Response::Value(v.clone()),
                    None => Response::Local(LocalResult::new(Status::KeyNotFound, 0)),
                },
                Request::CheckExist(k) => {
                    let found = values.contains_key(&k.keys[0]);
                    Response::Local(LocalResult::new(
                        if found { Status::Finish } else { Status::KeyNotFound },
                        found as i32,
                    ))
                }
                _ => Response::Local(LocalResult::new(Status::InvalidRequest, 0)),
            };
            seen.push(req);
            if stream.write_all(&encode_response(&resp).unwrap()).is_err() {
                break;
            }
        }
        seen
    });
    let config = ClientConfig {
        host_addr: addr.ip().to_string(),
        service_port: addr.port(),
        connection_type: ConnectionType::Tcp,
        ..ClientConfig::default()
    };
    (config, handle)
}

// ── Before setup ────────────────────────────────────────────────────

#[test]
fn test_invalid_config_is_rejected() {
    let config = ClientConfig {
        max_outstanding: 0,
        ..ClientConfig::default()
    };
    assert!(matches!(Connection::new(config), Err(KvError::Config(_))));
}

#[test]
fn test_operations_before_setup_fail() {
    let conn = Connection::new(ClientConfig::default()).unwrap();

    assert!(matches!(
        conn.check_exist("k"),
        Err(KvError::NotConnected("control"))
    ));
    assert!(matches!(conn.r_tcp("k"), Err(KvError::NotConnected("control"))));
    assert!(matches!(
        conn.allocate_rdma(&["k".to_string()], 4096),
        Err(KvError::NotConnected("rdma"))
    ));
    assert!(matches!(
        conn.r_rdma(&[Block::new("k", 0)], 4096, 0x1000),
        Err(KvError::NotConnected("rdma"))
    ));
    let remote = [RemoteBlock {
        rkey: 1,
        remote_addr: 0x2000,
    }];
    assert!(matches!(
        conn.w_rdma(&[0], 4096, &remote, 0x1000),
        Err(KvError::NotConnected("rdma"))
    ));
    assert!(matches!(conn.sync_rdma(), Err(KvError::NotConnected("rdma"))));

    let mut buf = vec![0u8; 64];
    let err = unsafe { conn.register_mr(buf.as_mut_ptr(), buf.len()) }.unwrap_err();
    assert!(matches!(err, KvError::NotConnected("rdma")));

    assert_eq!(conn.outstanding(), 0);
    assert_eq!(conn.in_flight(), 0);
    assert!(!conn.is_rdma_ready());
}

#[test]
fn test_setup_rdma_requires_control_channel() {
    let mut conn = Connection::new(ClientConfig::default()).unwrap();
    assert!(matches!(
        conn.setup_rdma(),
        Err(KvError::NotConnected("control"))
    ));
}

// ── TCP-only session ────────────────────────────────────────────────

#[test]
fn test_tcp_session() {
    let (config, store) = spawn_store();
    let mut conn = Connection::new(config).unwrap();
    conn.init_connection().unwrap();
    assert!(matches!(
        conn.init_connection(),
        Err(KvError::AlreadyInitialized(_))
    ));

    conn.w_tcp("small", b"value bytes").unwrap();
    assert_eq!(conn.r_tcp("small").unwrap(), b"value bytes");
    assert!(conn.check_exist("small").unwrap());
    assert!(!conn.check_exist("other").unwrap());
    assert!(matches!(
        conn.r_tcp("other"),
        Err(KvError::Status(Status::KeyNotFound))
    ));

    // No queue pair in TCP mode.
    assert!(matches!(conn.setup_rdma(), Err(KvError::NotConnected("rdma"))));

    conn.close_conn();
    conn.close_conn();
    assert!(matches!(
        conn.check_exist("small"),
        Err(KvError::NotConnected("control"))
    ));

    let seen = store.join().unwrap();
    assert_eq!(seen.len(), 5);
}

#[test]
fn test_drop_closes_control_channel() {
    let (config, store) = spawn_store();
    let mut conn = Connection::new(config).unwrap();
    conn.init_connection().unwrap();
    conn.w_tcp("k", b"v").unwrap();
    drop(conn);
    // The store's read loop ends once the socket is shut down.
    assert_eq!(store.join().unwrap().len(), 1);
}

// ── Hardware ────────────────────────────────────────────────────────

#[test]
fn test_local_verbs_resources() {
    if kvcache_rdma::device_names().is_empty() {
        tracing::warn!("no RDMA devices, skipping");
        return;
    }
    let ctx = match RdmaContext::open(&ClientConfig::default()) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::warn!(error = %e, "RDMA device unusable, skipping");
            return;
        }
    };

    let buf = RegisteredBuffer::new(&ctx, 4096).unwrap();
    assert_eq!(buf.len(), 4096);
    assert_ne!(buf.lkey(), 0);

    let registry = MrRegistry::new(Arc::clone(&ctx));
    let mut host = vec![0u8; 1 << 20];
    let region = unsafe { registry.register(host.as_mut_ptr(), host.len()) }.unwrap();
    let again = unsafe { registry.register(host.as_mut_ptr(), 4096) }.unwrap();
    assert_eq!(region, again);
    assert_eq!(registry.len(), 1);
    assert!(registry.lookup(region.base + 4096, 4096).is_ok());
    assert!(registry.lookup(region.end(), 1).is_err());

    let qp = QueuePair::create(&ctx, 16, 16).unwrap();
    let info = qp.local_info();
    assert_eq!(info.qpn, qp.qp_num());
    assert!(info.psn <= 0x00ff_ffff);
    assert_eq!(info.gid, ctx.gid());
}
