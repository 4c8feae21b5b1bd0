use crate::base::{
    AddressFamily, SockError, SocketKind, SocketOption, TimeoutMs,
};
use crate::berkeley::{NetStack, OverlappedResult};
use crate::engine::mock::MockEngine;
use crate::engine::make_version;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const V1_0: u16 = make_version(1, 0);

fn started_stack(engine: MockEngine) -> NetStack {
    let stack = NetStack::new(Arc::new(engine));
    stack.startup(V1_0).unwrap();
    stack
}

fn timeout_bytes(ms: TimeoutMs) -> [u8; 4] {
    ms.to_ne_bytes()
}

/// An overlapped completion signals its waiter before the engine thread
/// releases the context; the leak check has to allow that window.
fn drain_contexts(stack: &NetStack) {
    for _ in 0..200 {
        if stack.contexts_in_flight() == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("contexts still in flight: {}", stack.contexts_in_flight());
}

#[test]
fn test_calls_fail_before_startup() {
    let stack = NetStack::new(Arc::new(MockEngine::new()));
    assert_eq!(
        stack.socket(AddressFamily::Ipv4, SocketKind::Stream),
        Err(SockError::NotInitialized)
    );
    assert_eq!(stack.close(4), Err(SockError::NotInitialized));
    assert_eq!(stack.shutdown(), Err(SockError::NotInitialized));
}

#[test]
fn test_startup_negotiates_version() {
    let stack = NetStack::new(Arc::new(MockEngine::new()));
    assert_eq!(stack.startup(make_version(9, 9)), Err(SockError::InvalidArgument));

    let info = stack.startup(V1_0).unwrap();
    assert_eq!(info.lowest_version, make_version(1, 0));
    assert_eq!(info.highest_version, make_version(1, 1));
    stack.shutdown().unwrap();
}

#[test]
fn test_shutdown_refcount_and_open_socket_guard() {
    let stack = started_stack(MockEngine::new());
    stack.startup(V1_0).unwrap();

    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();

    // 2 -> 1 succeeds even with sockets open; only the final shutdown
    // cares.
    stack.shutdown().unwrap();
    assert_eq!(stack.shutdown(), Err(SockError::SocketsStillOpen));

    stack.close(s).unwrap();
    stack.shutdown().unwrap();
    assert_eq!(stack.shutdown(), Err(SockError::NotInitialized));
}

#[test]
fn test_handles_monotonic_and_never_reused() {
    let stack = started_stack(MockEngine::new());

    let a = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    let b = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();
    assert_eq!(a, 4);
    assert_eq!(b, 8);

    stack.close(a).unwrap();
    let c = stack.socket(AddressFamily::Ipv6, SocketKind::Stream).unwrap();
    assert_eq!(c, 12);
    assert_eq!(stack.close(a), Err(SockError::InvalidHandle));

    stack.close(b).unwrap();
    stack.close(c).unwrap();
    stack.shutdown().unwrap();
}

#[test]
fn test_dispatch_rejects_operations_for_class() {
    let stack = started_stack(MockEngine::new());

    let dgram = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();
    assert_eq!(stack.listen(dgram, 16), Err(SockError::UnsupportedForClass));
    assert_eq!(stack.accept(dgram).unwrap_err(), SockError::UnsupportedForClass);

    let stream = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    let peer = "127.0.0.1:9".parse().unwrap();
    assert_eq!(
        stack.send_to(stream, b"x", peer, 0, None, None),
        Err(SockError::UnsupportedForClass)
    );
}

#[test]
fn test_dispatch_table_rows_per_class() {
    use crate::base::SocketClass;
    use crate::berkeley::{allowed, OpKind};

    // The split listen/connection classes each get a strict subset of
    // the unified stream rows.
    assert!(allowed(SocketClass::Listen, OpKind::Accept));
    assert!(allowed(SocketClass::Listen, OpKind::Bind));
    assert!(!allowed(SocketClass::Listen, OpKind::Send));
    assert!(!allowed(SocketClass::Listen, OpKind::Connect));
    assert!(allowed(SocketClass::Connection, OpKind::Send));
    assert!(!allowed(SocketClass::Connection, OpKind::Accept));
    assert!(allowed(SocketClass::Stream, OpKind::Listen));
    assert!(!allowed(SocketClass::Stream, OpKind::SendTo));
    assert!(allowed(SocketClass::Datagram, OpKind::RecvFrom));
    assert!(!allowed(SocketClass::Datagram, OpKind::Listen));
}

#[test]
fn test_transfer_flags_rejected() {
    let stack = started_stack(MockEngine::new());
    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();

    assert_eq!(stack.send(s, b"x", 1, None, None), Err(SockError::InvalidArgument));
    let mut buf = [0u8; 4];
    assert_eq!(stack.recv(s, &mut buf, 0x80, None, None), Err(SockError::InvalidArgument));
}

#[test]
fn test_callback_requires_overlapped_record() {
    let stack = started_stack(MockEngine::new());
    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();

    let out = stack.send(s, b"x", 0, None, Some(Box::new(|_, _| {})));
    assert_eq!(out, Err(SockError::InvalidArgument));
    assert_eq!(stack.contexts_in_flight(), 0);
}

#[test]
fn test_blocking_send_reports_bytes() {
    let stack = started_stack(MockEngine::new());
    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    assert_eq!(stack.send(s, b"ping", 0, None, None), Ok(4));
    assert_eq!(stack.contexts_in_flight(), 0);
}

#[test]
fn test_recv_copies_back_queued_payload() {
    let engine = Arc::new(MockEngine::new());
    let stack = NetStack::new(Arc::clone(&engine) as Arc<dyn crate::engine::Engine>);
    stack.startup(V1_0).unwrap();

    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    engine.last_created().push_recv(Bytes::from_static(b"pong"));

    let mut buf = [0u8; 8];
    assert_eq!(stack.recv(s, &mut buf, 0, None, None), Ok(4));
    assert_eq!(&buf[..4], b"pong");
    assert_eq!(stack.contexts_in_flight(), 0);
}

#[test]
fn test_recv_truncates_to_caller_buffer() {
    let engine = Arc::new(MockEngine::new());
    let stack = NetStack::new(Arc::clone(&engine) as Arc<dyn crate::engine::Engine>);
    stack.startup(V1_0).unwrap();

    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    engine.last_created().push_recv(Bytes::from_static(b"longer than four"));

    // The provider receives a descriptor sized to the caller's buffer
    // and can never deliver more than fits.
    let mut buf = [0u8; 4];
    assert_eq!(stack.recv(s, &mut buf, 0, None, None), Ok(4));
    assert_eq!(&buf, b"long");
    assert_eq!(stack.contexts_in_flight(), 0);
}

#[test]
fn test_recv_timeout_cancels_and_frees_context() {
    let stack = started_stack(MockEngine::new());
    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    stack.set_option(s, SocketOption::ReceiveTimeout, &timeout_bytes(30)).unwrap();

    // Nothing queued: the mock holds the receive open until cancelled.
    let mut buf = [0u8; 8];
    let start = Instant::now();
    assert_eq!(stack.recv(s, &mut buf, 0, None, None), Err(SockError::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(30));

    // The context came back even though the engine finished late.
    assert_eq!(stack.contexts_in_flight(), 0);
}

#[test]
fn test_timeout_options_are_registry_resident() {
    let stack = started_stack(MockEngine::new());
    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();

    assert_eq!(
        stack.get_option(s, SocketOption::ReceiveTimeout).unwrap(),
        timeout_bytes(TimeoutMs::MAX).to_vec()
    );
    stack.set_option(s, SocketOption::SendTimeout, &timeout_bytes(250)).unwrap();
    assert_eq!(
        stack.get_option(s, SocketOption::SendTimeout).unwrap(),
        timeout_bytes(250).to_vec()
    );

    assert_eq!(
        stack.set_option(s, SocketOption::SendTimeout, b"xy"),
        Err(SockError::InvalidArgument)
    );
    assert_eq!(
        stack.set_option(9999, SocketOption::SendTimeout, &timeout_bytes(1)),
        Err(SockError::InvalidHandle)
    );
}

#[test]
fn test_table_usable_while_operation_in_flight() {
    let stack = Arc::new(started_stack(MockEngine::with_delay(Duration::from_millis(150))));
    let slow = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();

    let sender = {
        let stack = Arc::clone(&stack);
        thread::spawn(move || stack.send(slow, b"slow", 0, None, None))
    };
    thread::sleep(Duration::from_millis(20));

    // Table mutations must not queue behind the in-flight send.
    let start = Instant::now();
    for _ in 0..8 {
        let s = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();
        stack.close(s).unwrap();
    }
    assert!(start.elapsed() < Duration::from_millis(100));

    assert_eq!(sender.join().unwrap(), Ok(4));
    assert_eq!(stack.contexts_in_flight(), 0);
}

#[test]
fn test_accept_rolls_back_when_table_full() {
    let engine = MockEngine::new();
    let stack = NetStack::with_limits(Arc::new(engine), 1, 16);
    stack.startup(V1_0).unwrap();

    let listener = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    stack.listen(listener, 4).unwrap();

    // The lone table slot is taken by the listener; the accepted
    // connection cannot be registered and must be closed again.
    assert_eq!(stack.accept(listener).unwrap_err(), SockError::ResourceExhausted);
    assert_eq!(stack.open_sockets(), 1);
    assert_eq!(stack.contexts_in_flight(), 0);
}

#[test]
fn test_overlapped_send_runs_callback_before_wait_returns() {
    let stack = started_stack(MockEngine::with_delay(Duration::from_millis(20)));
    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let record = OverlappedResult::new();
    let cb = {
        let seen = Arc::clone(&seen);
        Box::new(move |status: Result<(), SockError>, bytes: usize| {
            assert_eq!(status, Ok(()));
            seen.store(bytes, Ordering::SeqCst);
        })
    };

    assert_eq!(stack.send(s, b"ping", 0, Some(&record), Some(cb)), Err(SockError::Pending));
    assert_eq!(stack.wait_overlapped(s, &record, true), Ok(4));
    // Completion implies the callback already ran.
    assert_eq!(seen.load(Ordering::SeqCst), 4);
    drain_contexts(&stack);
}

#[test]
fn test_wait_overlapped_nonblocking_reports_pending() {
    let stack = started_stack(MockEngine::with_delay(Duration::from_millis(80)));
    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();

    let record = OverlappedResult::new();
    assert_eq!(stack.send(s, b"abc", 0, Some(&record), None), Err(SockError::Pending));
    assert_eq!(stack.wait_overlapped(s, &record, false), Err(SockError::Pending));
    assert_eq!(stack.wait_overlapped(s, &record, true), Ok(3));

    assert_eq!(stack.wait_overlapped(9999, &record, false), Err(SockError::InvalidHandle));
}

#[test]
fn test_overlapped_recv_from_delivers_payload_and_source() {
    let engine = Arc::new(MockEngine::new());
    let stack = NetStack::new(Arc::clone(&engine) as Arc<dyn crate::engine::Engine>);
    stack.startup(V1_0).unwrap();

    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();
    engine.last_created().push_recv(Bytes::from_static(b"hello"));

    let record = OverlappedResult::new();
    let mut buf = [0u8; 16];
    assert_eq!(
        stack.recv_from(s, &mut buf, 0, Some(&record), None).unwrap_err(),
        SockError::Pending
    );

    assert_eq!(stack.wait_overlapped(s, &record, true), Ok(5));
    let peer = record.peer_addr().expect("datagram completion carries its source");
    assert_eq!(record.take_data().unwrap(), Bytes::from_static(b"hello"));
    // Draining the bytes must not erase the source address.
    assert_eq!(record.peer_addr(), Some(peer));
    drain_contexts(&stack);
}

#[test]
fn test_legacy_engine_composite_stream_end_to_end() {
    let stack = started_stack(MockEngine::legacy());
    let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();

    stack.bind(s, "0.0.0.0:0".parse().unwrap()).unwrap();
    stack.listen(s, 16).unwrap();

    // The composite committed to listening; connecting is now out.
    assert_eq!(
        stack.connect(s, "127.0.0.1:9".parse().unwrap()),
        Err(SockError::UnsupportedForClass)
    );

    let (accepted, _peer) = stack.accept(s).unwrap();
    assert_eq!(stack.send(accepted, b"hi", 0, None, None), Ok(2));

    stack.close(accepted).unwrap();
    stack.close(s).unwrap();
    stack.shutdown().unwrap();
}

#[test]
fn test_mixed_workload_leaves_no_contexts_behind() {
    let stack = Arc::new(started_stack(MockEngine::with_delay(Duration::from_millis(5))));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let stack = Arc::clone(&stack);
        workers.push(thread::spawn(move || {
            for _ in 0..8 {
                let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
                let _ = stack.send(s, b"data", 0, None, None);
                let record = OverlappedResult::new();
                if stack.send(s, b"more", 0, Some(&record), None) == Err(SockError::Pending) {
                    let _ = stack.wait_overlapped(s, &record, true);
                }
                stack.close(s).unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    drain_contexts(&stack);
    assert_eq!(stack.open_sockets(), 0);
}
