//! Dispatcher behaviour against an in-memory NIC.

mod common;

use common::{Outcomes, harness};
use kvcache::completion::WorkCompletion;
use kvcache::protocol::{LocalResult, RemoteMetaRequest, RemoteMetaResponse, Request, Response};
use kvcache::{KvError, RemoteBlock, ResponseWaiter, Status};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

fn read_req(key: &str) -> Request {
    Request::RdmaRead(RemoteMetaRequest {
        keys: vec![key.to_string()],
        block_size: 4096,
        rkey: 7,
        remote_addrs: vec![0x4000],
    })
}

fn alloc_req(keys: &[&str]) -> Request {
    Request::Allocate(RemoteMetaRequest {
        keys: keys.iter().map(|k| k.to_string()).collect(),
        block_size: 4096,
        rkey: 0,
        remote_addrs: Vec::new(),
    })
}

fn finish() -> Response {
    Response::Local(LocalResult::new(Status::Finish, 0))
}

// ── Throttling ──────────────────────────────────────────────────────

#[test]
fn test_reads_beyond_capacity_are_deferred_in_order() {
    let h = harness(8, 20);
    let outcomes = Outcomes::default();

    for tag in 0..20u32 {
        h.submit_message(
            &read_req(&format!("k{tag}")),
            tag,
            ResponseWaiter::ReadAck {
                callback: outcomes.callback(),
            },
        )
        .unwrap();
    }

    assert_eq!(h.nic().sent_tags(), (0..8).collect::<Vec<_>>());
    assert_eq!(h.dispatcher.outstanding(), 8);
    assert_eq!(h.dispatcher.deferred(), 12);
    assert_eq!(h.dispatcher.awaiting_response(), 20);

    // Each send completion frees exactly one slot for the next parked read.
    let mut completed = 0;
    while completed < 20 {
        let id = h.nic().sent_ids()[completed];
        h.complete_ok(id);
        completed += 1;
        assert!(h.dispatcher.outstanding() <= 8);
        assert_eq!(h.nic().sent_ids().len(), (completed + 8).min(20));
    }
    assert_eq!(h.nic().sent_tags(), (0..20).collect::<Vec<_>>());
    assert_eq!(h.dispatcher.deferred(), 0);
    assert_eq!(h.dispatcher.peak_outstanding(), 8);

    for _ in 0..20 {
        h.deliver(&finish());
    }
    assert_eq!(outcomes.ok(), 20);
    assert_eq!(outcomes.err(), 0);
    assert_eq!(h.dispatcher.in_flight(), 0);
    assert_eq!(h.dispatcher.outstanding(), 0);
    // Receive buffers are re-posted as responses arrive.
    assert_eq!(h.nic().posted_recvs(), 20);
}

#[test]
fn test_write_larger_than_queue_is_rejected() {
    let h = harness(8, 2);
    let outcomes = Outcomes::default();
    let err = h.submit_write(9, 0, outcomes.callback()).unwrap_err();
    assert!(matches!(err, KvError::InvalidRequest(_)));
    assert_eq!(outcomes.total(), 0);
    assert_eq!(h.dispatcher.in_flight(), 0);
    assert_eq!(h.dispatcher.live_contexts(), 2);
}

#[test]
fn test_heavy_write_waits_behind_queue_head() {
    let h = harness(8, 2);
    let outcomes = Outcomes::default();
    let first = h.submit_write(6, 1, outcomes.callback()).unwrap();
    h.submit_write(4, 2, outcomes.callback()).unwrap();
    // Fits by itself, but must not overtake the parked write.
    h.submit_write(1, 3, outcomes.callback()).unwrap();
    assert_eq!(h.nic().sent_tags(), vec![1]);
    assert_eq!(h.dispatcher.deferred(), 2);

    h.complete_ok(first);
    assert_eq!(h.nic().sent_tags(), vec![1, 2, 3]);
    assert_eq!(h.dispatcher.outstanding(), 5);
    assert_eq!(outcomes.ok(), 1);
}

// ── Writes ──────────────────────────────────────────────────────────

#[test]
fn test_write_callback_runs_once() {
    let h = harness(128, 4);
    let outcomes = Outcomes::default();
    let id = h.submit_write(16, 0, outcomes.callback()).unwrap();
    assert_eq!(h.dispatcher.outstanding(), 16);
    assert_eq!(h.dispatcher.in_flight(), 1);

    h.complete_ok(id);
    assert_eq!(outcomes.ok(), 1);
    assert_eq!(h.dispatcher.outstanding(), 0);
    assert_eq!(h.dispatcher.in_flight(), 0);

    // A duplicate completion finds no context.
    h.complete_ok(id);
    assert_eq!(outcomes.total(), 1);
    assert!(h.dispatcher.wait_idle_timeout(Duration::from_millis(10)).unwrap());
}

#[test]
fn test_failed_post_never_invokes_callback() {
    let h = harness(8, 2);
    let outcomes = Outcomes::default();
    h.nic().fail_sends.store(true, Ordering::SeqCst);

    let err = h.submit_write(3, 0, outcomes.callback()).unwrap_err();
    assert!(matches!(err, KvError::Device { .. }));
    let err = h
        .submit_message(
            &read_req("k"),
            1,
            ResponseWaiter::ReadAck {
                callback: outcomes.callback(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, KvError::Device { .. }));

    assert_eq!(outcomes.total(), 0);
    assert_eq!(h.dispatcher.outstanding(), 0);
    assert_eq!(h.dispatcher.in_flight(), 0);
    assert_eq!(h.dispatcher.awaiting_response(), 0);
    assert_eq!(h.send_pool.in_use(), 0);
}

// ── Allocation ──────────────────────────────────────────────────────

#[test]
fn test_allocate_returns_blocks() {
    let h = harness(8, 4);
    let got = Arc::new(Mutex::new(None));
    let got2 = Arc::clone(&got);
    let id = h
        .submit_message(
            &alloc_req(&["a", "b"]),
            0,
            ResponseWaiter::Allocate {
                expected: 2,
                callback: Box::new(move |r: kvcache::Result<Vec<RemoteBlock>>| {
                    *got2.lock().unwrap() = Some(r)
                }),
            },
        )
        .unwrap();
    h.complete_ok(id);
    let blocks = vec![
        RemoteBlock {
            rkey: 9,
            remote_addr: 0x1000,
        },
        RemoteBlock {
            rkey: 9,
            remote_addr: 0x2000,
        },
    ];
    h.deliver(&Response::Remote(RemoteMetaResponse {
        blocks: blocks.clone(),
        error_code: 0,
    }));
    let r = got.lock().unwrap().take().unwrap();
    assert_eq!(r.unwrap(), blocks);
}

#[test]
fn test_allocate_retry_leaves_connection_usable() {
    let h = harness(8, 4);
    let got = Arc::new(Mutex::new(None));
    let got2 = Arc::clone(&got);
    let id = h
        .submit_message(
            &alloc_req(&["a", "b", "c"]),
            0,
            ResponseWaiter::Allocate {
                expected: 3,
                callback: Box::new(move |r: kvcache::Result<Vec<RemoteBlock>>| {
                    *got2.lock().unwrap() = Some(r)
                }),
            },
        )
        .unwrap();
    h.complete_ok(id);
    h.deliver(&Response::Remote(RemoteMetaResponse {
        blocks: Vec::new(),
        error_code: Status::Retry.code(),
    }));

    let err = got.lock().unwrap().take().unwrap().unwrap_err();
    assert!(err.is_retryable());
    assert!(!h.dispatcher.is_broken());

    let outcomes = Outcomes::default();
    let id = h
        .submit_message(
            &read_req("a"),
            1,
            ResponseWaiter::ReadAck {
                callback: outcomes.callback(),
            },
        )
        .unwrap();
    h.complete_ok(id);
    h.deliver(&finish());
    assert_eq!(outcomes.ok(), 1);
}

#[test]
fn test_undecodable_response_fails_only_its_waiter() {
    let h = harness(8, 4);
    let outcomes = Outcomes::default();
    for tag in 0..2 {
        let id = h
            .submit_message(
                &read_req("k"),
                tag,
                ResponseWaiter::ReadAck {
                    callback: outcomes.callback(),
                },
            )
            .unwrap();
        h.complete_ok(id);
    }

    // Garbage frame: wrong magic.
    let (wr_id, addr, _) = h.nic().recvs.lock().unwrap().pop_front().unwrap();
    let junk = [0u8; 9];
    unsafe { std::ptr::copy_nonoverlapping(junk.as_ptr(), addr as *mut u8, junk.len()) };
    h.dispatcher
        .complete(WorkCompletion::success(wr_id, junk.len()))
        .unwrap();
    assert_eq!(outcomes.err(), 1);
    assert!(outcomes.errors.lock().unwrap()[0].contains("protocol mismatch"));

    h.deliver(&finish());
    assert_eq!(outcomes.ok(), 1);
}

// ── Failure and shutdown ────────────────────────────────────────────

#[test]
fn test_failed_completion_breaks_connection() {
    let h = harness(4, 4);
    let writes = Outcomes::default();
    let reads = Outcomes::default();

    let write = h.submit_write(4, 0, writes.callback()).unwrap();
    h.submit_message(
        &read_req("parked"),
        1,
        ResponseWaiter::ReadAck {
            callback: reads.callback(),
        },
    )
    .unwrap();
    assert_eq!(h.dispatcher.deferred(), 1);

    h.dispatcher
        .complete(WorkCompletion::failed(write, 12, 0x81))
        .unwrap();

    assert!(h.dispatcher.is_broken());
    assert_eq!(writes.err(), 1);
    assert!(writes.errors.lock().unwrap()[0].contains("work completion failed"));
    assert_eq!(reads.err(), 1);
    assert!(reads.errors.lock().unwrap()[0].contains("broken"));
    assert_eq!(h.dispatcher.in_flight(), 0);
    // The parked read never reached the wire.
    assert_eq!(h.nic().sent_tags(), vec![0]);

    let late = Outcomes::default();
    let err = h.submit_write(1, 2, late.callback()).unwrap_err();
    assert!(matches!(err, KvError::ConnectionBroken));
    assert_eq!(late.total(), 0);
    assert!(matches!(
        h.dispatcher.wait_idle(),
        Err(KvError::ConnectionBroken)
    ));
}

#[test]
fn test_shutdown_fails_everything_once() {
    let h = harness(4, 4);
    let outcomes = Outcomes::default();
    h.submit_write(3, 0, outcomes.callback()).unwrap();
    h.submit_write(3, 1, outcomes.callback()).unwrap();
    h.submit_message(
        &read_req("k"),
        2,
        ResponseWaiter::ReadAck {
            callback: outcomes.callback(),
        },
    )
    .unwrap();
    assert_eq!(h.dispatcher.in_flight(), 3);

    let settled = h.dispatcher.shutdown().unwrap();
    assert_eq!(settled, 1);
    assert_eq!(outcomes.err(), 3);
    assert!(
        outcomes
            .errors
            .lock()
            .unwrap()
            .iter()
            .all(|e| e == "connection closed")
    );
    assert_eq!(h.dispatcher.in_flight(), 0);
    assert_eq!(h.dispatcher.outstanding(), 0);
    assert_eq!(h.dispatcher.live_contexts(), 0);
    assert_eq!(h.send_pool.in_use(), 0);

    // Stray completions after shutdown are ignored.
    h.complete_ok(9999);
    assert_eq!(outcomes.total(), 3);
    assert!(matches!(
        h.submit_write(1, 3, outcomes.callback()),
        Err(KvError::ConnectionClosed)
    ));
}

#[test]
fn test_engine_failure_settles_posted_work() {
    let h = Arc::new(harness(8, 2));
    let outcomes = Outcomes::default();
    h.submit_write(4, 0, outcomes.callback()).unwrap();
    h.submit_message(
        &read_req("k"),
        1,
        ResponseWaiter::ReadAck {
            callback: outcomes.callback(),
        },
    )
    .unwrap();
    assert_eq!(h.dispatcher.in_flight(), 2);

    let (tx, rx) = mpsc::channel();
    let waiter = Arc::clone(&h);
    let blocked = std::thread::spawn(move || {
        tx.send(waiter.dispatcher.wait_idle()).unwrap();
    });

    h.dispatcher.mark_broken().unwrap();

    let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(res, Err(KvError::ConnectionBroken)));
    blocked.join().unwrap();

    assert_eq!(outcomes.err(), 2);
    assert!(
        outcomes
            .errors
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.contains("broken"))
    );
    assert_eq!(h.dispatcher.in_flight(), 0);
    assert_eq!(h.dispatcher.outstanding(), 0);
    assert_eq!(h.dispatcher.live_contexts(), 0);

    // Shutdown afterwards finds nothing left to settle.
    assert_eq!(h.dispatcher.shutdown().unwrap(), 0);
    assert_eq!(outcomes.total(), 2);
}

// ── Concurrency ─────────────────────────────────────────────────────

#[test]
fn test_concurrent_writers_never_exceed_capacity() {
    const CAPACITY: usize = 8;
    const THREADS: usize = 4;
    const PER_THREAD: usize = 50;

    let h = Arc::new(harness(CAPACITY, 2));
    let (tx, rx) = mpsc::channel::<u64>();
    *h.nic().wire.lock().unwrap() = Some(tx);

    // Completes whatever reaches the wire, in order.
    let hw = {
        let h = Arc::clone(&h);
        std::thread::spawn(move || {
            let mut done = 0;
            while done < THREADS * PER_THREAD {
                let id = rx.recv().unwrap();
                h.complete_ok(id);
                done += 1;
            }
        })
    };

    let outcomes = Outcomes::default();
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let h = Arc::clone(&h);
            let outcomes = outcomes.clone();
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let blocks = 1 + (t + i) % 4;
                    h.submit_write(blocks, (t * PER_THREAD + i) as u32, outcomes.callback())
                        .unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    hw.join().unwrap();

    h.dispatcher.wait_idle().unwrap();
    assert_eq!(outcomes.ok(), THREADS * PER_THREAD);
    assert_eq!(outcomes.err(), 0);
    assert!(h.dispatcher.peak_outstanding() <= CAPACITY);
    assert_eq!(h.dispatcher.outstanding(), 0);
    assert_eq!(h.dispatcher.deferred(), 0);
}

#[tokio::test]
async fn test_callback_settles_async_waiter() {
    let h = Arc::new(harness(8, 4));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let id = h
        .submit_message(
            &alloc_req(&["a"]),
            0,
            ResponseWaiter::Allocate {
                expected: 1,
                callback: Box::new(move |r: kvcache::Result<Vec<RemoteBlock>>| {
                    let _ = tx.send(r);
                }),
            },
        )
        .unwrap();

    let nic = Arc::clone(&h);
    let hw = std::thread::spawn(move || {
        nic.complete_ok(id);
        nic.deliver(&Response::Remote(RemoteMetaResponse {
            blocks: vec![RemoteBlock {
                rkey: 3,
                remote_addr: 0x8000,
            }],
            error_code: 0,
        }));
    });

    let blocks = rx.await.unwrap().unwrap();
    assert_eq!(blocks[0].remote_addr, 0x8000);
    hw.join().unwrap();
    assert_eq!(h.dispatcher.in_flight(), 0);
}
