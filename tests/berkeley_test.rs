//! End-to-end tests over the real tokio-backed engine and loopback.

use sockbridge::engine::make_version;
use sockbridge::{AddressFamily, NetStack, SockError, SocketKind, SocketOption, TokioEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn started_stack() -> Arc<NetStack> {
    let engine = Arc::new(TokioEngine::new().unwrap());
    let stack = Arc::new(NetStack::new(engine));
    stack.startup(make_version(2, 0)).unwrap();
    stack
}

fn recv_exact(stack: &NetStack, handle: u32, want: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    let mut buf = vec![0u8; want];
    while out.len() < want {
        let n = stack.recv(handle, &mut buf[..want - out.len()], 0, None, None).unwrap();
        assert!(n > 0, "connection closed before {} bytes arrived", want);
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn test_stream_ping_echo_over_loopback() {
    let stack = started_stack();
    let addr: SocketAddr = "0.0.0.0:20211".parse().unwrap();

    let listener = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    stack.bind(listener, addr).unwrap();
    stack.listen(listener, 16).unwrap();

    let server = {
        let stack = Arc::clone(&stack);
        thread::spawn(move || {
            let (conn, peer) = stack.accept(listener).unwrap();
            assert_eq!(peer.ip().to_string(), "127.0.0.1");
            let msg = recv_exact(&stack, conn, 4);
            assert_eq!(stack.send(conn, &msg, 0, None, None), Ok(4));
            stack.close(conn).unwrap();
        })
    };

    let client = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    stack.connect(client, "127.0.0.1:20211".parse().unwrap()).unwrap();
    assert_eq!(stack.send(client, b"ping", 0, None, None), Ok(4));
    assert_eq!(recv_exact(&stack, client, 4), b"ping");

    server.join().unwrap();
    stack.close(client).unwrap();
    stack.close(listener).unwrap();
    assert_eq!(stack.open_sockets(), 0);
    assert_eq!(stack.contexts_in_flight(), 0);
    stack.shutdown().unwrap();
}

#[test]
fn test_datagram_roundtrip_with_source_address() {
    let stack = started_stack();

    let a = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();
    let b = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();
    stack.bind(a, "127.0.0.1:0".parse().unwrap()).unwrap();
    stack.bind(b, "127.0.0.1:0".parse().unwrap()).unwrap();

    let a_addr = stack.local_addr(a).unwrap();
    let b_addr = stack.local_addr(b).unwrap();
    assert_ne!(a_addr.port(), 0);

    assert_eq!(stack.send_to(a, b"datagram", b_addr, 0, None, None), Ok(8));

    let mut buf = [0u8; 32];
    let (n, src) = stack.recv_from(b, &mut buf, 0, None, None).unwrap();
    assert_eq!(&buf[..n], b"datagram");
    assert_eq!(src, a_addr);

    stack.close(a).unwrap();
    stack.close(b).unwrap();
    stack.shutdown().unwrap();
}

#[test]
fn test_recv_timeout_on_idle_connection() {
    let stack = started_stack();
    let addr: SocketAddr = "127.0.0.1:20212".parse().unwrap();

    let listener = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    stack.bind(listener, addr).unwrap();
    stack.listen(listener, 4).unwrap();

    let server = {
        let stack = Arc::clone(&stack);
        thread::spawn(move || stack.accept(listener).unwrap())
    };

    let client = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    stack.connect(client, addr).unwrap();
    let (conn, _) = server.join().unwrap();

    stack
        .set_option(client, SocketOption::ReceiveTimeout, &100u32.to_ne_bytes())
        .unwrap();

    // The peer never sends; the receive must come back on its own.
    let mut buf = [0u8; 8];
    let start = Instant::now();
    assert_eq!(stack.recv(client, &mut buf, 0, None, None), Err(SockError::Timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(5));

    assert_eq!(stack.contexts_in_flight(), 0);
    for s in [client, conn, listener] {
        stack.close(s).unwrap();
    }
    stack.shutdown().unwrap();
}

#[test]
fn test_ioctl_nonblocking_mode_passthrough() {
    use sockbridge::engine::tokio_engine::FIONBIO;

    let stack = started_stack();
    let stream = stack.socket(AddressFamily::Ipv4, SocketKind::Stream).unwrap();
    let dgram = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();

    // Engine sockets are natively non-blocking: enabling the mode is a
    // no-op, disabling it is refused.
    let enable = 1u32.to_ne_bytes();
    let disable = 0u32.to_ne_bytes();
    assert_eq!(stack.ioctl(stream, FIONBIO, &enable), Ok(Vec::new()));
    assert_eq!(stack.ioctl(dgram, FIONBIO, &enable), Ok(Vec::new()));
    assert_eq!(stack.ioctl(stream, FIONBIO, &disable), Err(SockError::InvalidArgument));

    assert_eq!(stack.ioctl(stream, 0xdead_beef, &enable), Err(SockError::InvalidArgument));
    assert_eq!(stack.ioctl(9999, FIONBIO, &enable), Err(SockError::InvalidHandle));

    stack.close(stream).unwrap();
    stack.close(dgram).unwrap();
    stack.shutdown().unwrap();
}

#[test]
fn test_handles_remain_distinct_across_lifecycle() {
    let stack = started_stack();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..32 {
        let s = stack.socket(AddressFamily::Ipv4, SocketKind::Datagram).unwrap();
        assert!(seen.insert(s), "handle {} reissued", s);
        stack.close(s).unwrap();
    }
    stack.shutdown().unwrap();
}
