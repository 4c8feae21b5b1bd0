//! Production engine on the tokio runtime.
//!
//! Each engine socket is a small state machine over tokio's net types.
//! Operations that can suspend are spawned onto the engine runtime and
//! race the context's cancel token; whichever side wins, the task
//! delivers exactly one true completion through the bridge. Cheap calls
//! (bind, listen) finish inline and never touch the bridge, exercising
//! the synchronous-completion path of the operation contract.

use crate::base::{AddressFamily, SockError, SockResult};
use crate::bridge::completion::complete;
use crate::bridge::context::{OpContext, OpPayload};
use crate::engine::{make_version, Engine, Issue, ProviderInfo, ProviderSocket};
use bytes::{Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::runtime::{Handle, Runtime};

// Raw option codes honored by the passthrough surface.
pub const SOL_SOCKET: i32 = 1;
pub const SO_BROADCAST: i32 = 6;
pub const SO_SNDBUF: i32 = 7;
pub const SO_RCVBUF: i32 = 8;
pub const IPPROTO_IP: i32 = 0;
pub const IP_TTL: i32 = 2;

/// Blocking-mode control code. Engine sockets live on the reactor and
/// are natively non-blocking; requesting non-blocking mode is a no-op
/// and requesting blocking mode is rejected.
pub const FIONBIO: u32 = 0x8004_667E;

fn ioctl_fionbio(code: u32, input: &[u8]) -> SockResult<Vec<u8>> {
    if code != FIONBIO {
        return Err(SockError::InvalidArgument);
    }
    if decode_u32(input)? == 0 {
        return Err(SockError::InvalidArgument);
    }
    Ok(Vec::new())
}

fn wildcard(family: AddressFamily) -> SocketAddr {
    match family {
        AddressFamily::Ipv4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        AddressFamily::Ipv6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

fn decode_u32(value: &[u8]) -> SockResult<u32> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| SockError::InvalidArgument)?;
    Ok(u32::from_ne_bytes(bytes))
}

fn encode_u32(value: u32) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

/// Spawn one pending operation: race the work against cooperative
/// cancellation and deliver the single true completion.
fn spawn_op<F>(handle: &Handle, ctx: &Arc<OpContext>, fut: F)
where
    F: std::future::Future<Output = (SockResult<()>, usize, OpPayload)> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    handle.spawn(async move {
        tokio::select! {
            biased;
            _ = ctx.cancel().cancelled() => {
                tracing::debug!("engine operation cancelled");
                complete(&ctx, Err(SockError::Cancelled), 0, OpPayload::None);
            }
            (status, bytes, payload) = fut => {
                complete(&ctx, status, bytes, payload);
            }
        }
    });
}

enum TcpState {
    Fresh,
    Bound { sock: TcpSocket, local: SocketAddr },
    Connecting,
    Listening { listener: Arc<TcpListener>, local: SocketAddr },
    Connected(ConnectedTcp),
    Closed,
}

#[derive(Clone)]
struct ConnectedTcp {
    rd: Arc<tokio::sync::Mutex<OwnedReadHalf>>,
    wr: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl ConnectedTcp {
    fn from_stream(stream: TcpStream) -> SockResult<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            rd: Arc::new(tokio::sync::Mutex::new(rd)),
            wr: Arc::new(tokio::sync::Mutex::new(wr)),
            local,
            peer,
        })
    }
}

/// A TCP engine object. Serves as the unified stream socket and, on the
/// legacy path, as both the listening object and the connection object;
/// which transitions a given caller may drive is the adapter's concern.
pub struct TcpSock {
    handle: Handle,
    family: AddressFamily,
    state: Arc<Mutex<TcpState>>,
}

impl std::fmt::Debug for TcpSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSock").field("family", &self.family).finish()
    }
}

impl TcpSock {
    fn fresh(handle: Handle, family: AddressFamily) -> Self {
        Self { handle, family, state: Arc::new(Mutex::new(TcpState::Fresh)) }
    }

    fn connected(handle: Handle, conn: ConnectedTcp) -> Self {
        let family = match conn.local {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        };
        Self { handle, family, state: Arc::new(Mutex::new(TcpState::Connected(conn))) }
    }

    fn new_socket(&self) -> SockResult<TcpSocket> {
        let sock = match self.family {
            AddressFamily::Ipv4 => TcpSocket::new_v4(),
            AddressFamily::Ipv6 => TcpSocket::new_v6(),
        }?;
        sock.set_reuseaddr(true)?;
        Ok(sock)
    }

    fn bind_locked(&self, state: &mut TcpState, addr: SocketAddr) -> SockResult<()> {
        match state {
            TcpState::Fresh => {
                let sock = self.new_socket()?;
                sock.bind(addr)?;
                let local = sock.local_addr()?;
                *state = TcpState::Bound { sock, local };
                Ok(())
            }
            _ => Err(SockError::InvalidArgument),
        }
    }
}

impl ProviderSocket for TcpSock {
    fn issue_bind(&self, addr: SocketAddr, _ctx: &Arc<OpContext>) -> Issue {
        let mut state = self.state.lock().unwrap();
        match self.bind_locked(&mut state, addr) {
            Ok(()) => Issue::ok(0),
            Err(e) => Issue::failed(e),
        }
    }

    fn issue_listen(&self, backlog: u32, _ctx: &Arc<OpContext>) -> Issue {
        let mut state = self.state.lock().unwrap();
        // Listening on a never-bound socket binds the wildcard address
        // first, matching ambient stream-socket behavior.
        if matches!(*state, TcpState::Fresh) {
            if let Err(e) = self.bind_locked(&mut state, wildcard(self.family)) {
                return Issue::failed(e);
            }
        }
        match std::mem::replace(&mut *state, TcpState::Closed) {
            TcpState::Bound { sock, local } => {
                // Registering with the reactor requires runtime context.
                let _guard = self.handle.enter();
                match sock.listen(backlog) {
                    Ok(listener) => {
                        *state = TcpState::Listening { listener: Arc::new(listener), local };
                        Issue::ok(0)
                    }
                    Err(e) => Issue::failed(e.into()),
                }
            }
            other => {
                *state = other;
                Issue::failed(SockError::InvalidArgument)
            }
        }
    }

    fn issue_connect(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let mut state = self.state.lock().unwrap();
        let bound = match std::mem::replace(&mut *state, TcpState::Connecting) {
            // Never bound: the connect itself performs the implicit
            // wildcard local bind.
            TcpState::Fresh => None,
            TcpState::Bound { sock, .. } => Some(sock),
            other => {
                *state = other;
                return Issue::failed(SockError::InvalidArgument);
            }
        };
        drop(state);

        let shared = Arc::clone(&self.state);
        spawn_op(&self.handle, ctx, async move {
            let connected = match bound {
                Some(sock) => sock.connect(addr).await,
                None => TcpStream::connect(addr).await,
            };
            match connected.map_err(SockError::from).and_then(ConnectedTcp::from_stream) {
                Ok(conn) => {
                    *shared.lock().unwrap() = TcpState::Connected(conn);
                    (Ok(()), 0, OpPayload::None)
                }
                Err(e) => {
                    *shared.lock().unwrap() = TcpState::Fresh;
                    (Err(e), 0, OpPayload::None)
                }
            }
        });
        Issue::Pending
    }

    fn issue_accept(&self, ctx: &Arc<OpContext>) -> Issue {
        let listener = match &*self.state.lock().unwrap() {
            TcpState::Listening { listener, .. } => Arc::clone(listener),
            _ => return Issue::failed(SockError::InvalidArgument),
        };
        let handle = self.handle.clone();
        spawn_op(&self.handle, ctx, async move {
            match listener.accept().await {
                Ok((stream, peer)) => match ConnectedTcp::from_stream(stream) {
                    Ok(conn) => {
                        let accepted: Arc<dyn ProviderSocket> =
                            Arc::new(TcpSock::connected(handle, conn));
                        (Ok(()), 0, OpPayload::Accepted(accepted, peer))
                    }
                    Err(e) => (Err(e), 0, OpPayload::None),
                },
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn issue_send(&self, data: Bytes, ctx: &Arc<OpContext>) -> Issue {
        let wr = match &*self.state.lock().unwrap() {
            TcpState::Connected(conn) => Arc::clone(&conn.wr),
            _ => return Issue::failed(SockError::NotConnected),
        };
        spawn_op(&self.handle, ctx, async move {
            let mut wr = wr.lock().await;
            match wr.write(&data).await {
                Ok(n) => (Ok(()), n, OpPayload::None),
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn issue_recv(&self, mut buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let rd = match &*self.state.lock().unwrap() {
            TcpState::Connected(conn) => Arc::clone(&conn.rd),
            _ => return Issue::failed(SockError::NotConnected),
        };
        spawn_op(&self.handle, ctx, async move {
            let mut rd = rd.lock().await;
            match rd.read(&mut buf).await {
                Ok(n) => {
                    buf.truncate(n);
                    (Ok(()), n, OpPayload::Data(buf.freeze()))
                }
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn issue_disconnect(&self, ctx: &Arc<OpContext>) -> Issue {
        let wr = match &*self.state.lock().unwrap() {
            TcpState::Connected(conn) => Arc::clone(&conn.wr),
            _ => return Issue::failed(SockError::NotConnected),
        };
        spawn_op(&self.handle, ctx, async move {
            let mut wr = wr.lock().await;
            match wr.shutdown().await {
                Ok(()) => (Ok(()), 0, OpPayload::None),
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn local_addr(&self) -> SockResult<SocketAddr> {
        match &*self.state.lock().unwrap() {
            TcpState::Bound { local, .. }
            | TcpState::Listening { local, .. }
            | TcpState::Connected(ConnectedTcp { local, .. }) => Ok(*local),
            _ => Err(SockError::NotConnected),
        }
    }

    fn peer_addr(&self) -> SockResult<SocketAddr> {
        match &*self.state.lock().unwrap() {
            TcpState::Connected(ConnectedTcp { peer, .. }) => Ok(*peer),
            _ => Err(SockError::NotConnected),
        }
    }

    fn set_raw_option(&self, level: i32, name: i32, value: &[u8]) -> SockResult<()> {
        let state = self.state.lock().unwrap();
        match (&*state, level, name) {
            (TcpState::Bound { sock, .. }, SOL_SOCKET, SO_SNDBUF) => {
                sock.set_send_buffer_size(decode_u32(value)?)?;
                Ok(())
            }
            (TcpState::Bound { sock, .. }, SOL_SOCKET, SO_RCVBUF) => {
                sock.set_recv_buffer_size(decode_u32(value)?)?;
                Ok(())
            }
            _ => Err(SockError::UnsupportedForClass),
        }
    }

    fn get_raw_option(&self, level: i32, name: i32) -> SockResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        match (&*state, level, name) {
            (TcpState::Bound { sock, .. }, SOL_SOCKET, SO_SNDBUF) => {
                Ok(encode_u32(sock.send_buffer_size()?))
            }
            (TcpState::Bound { sock, .. }, SOL_SOCKET, SO_RCVBUF) => {
                Ok(encode_u32(sock.recv_buffer_size()?))
            }
            _ => Err(SockError::UnsupportedForClass),
        }
    }

    fn ioctl(&self, code: u32, input: &[u8]) -> SockResult<Vec<u8>> {
        ioctl_fionbio(code, input)
    }

    fn close(&self) {
        *self.state.lock().unwrap() = TcpState::Closed;
    }
}

enum UdpState {
    Fresh,
    Bound { sock: Arc<UdpSocket>, local: SocketAddr, peer: Option<SocketAddr> },
    Closed,
}

/// A datagram engine object.
pub struct UdpSock {
    handle: Handle,
    family: AddressFamily,
    state: Arc<Mutex<UdpState>>,
}

impl std::fmt::Debug for UdpSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSock").field("family", &self.family).finish()
    }
}

impl UdpSock {
    fn fresh(handle: Handle, family: AddressFamily) -> Self {
        Self { handle, family, state: Arc::new(Mutex::new(UdpState::Fresh)) }
    }

    fn bind_locked(&self, state: &mut UdpState, addr: SocketAddr) -> SockResult<Arc<UdpSocket>> {
        match state {
            UdpState::Fresh => {
                let std_sock = std::net::UdpSocket::bind(addr)?;
                std_sock.set_nonblocking(true)?;
                let _guard = self.handle.enter();
                let sock = Arc::new(UdpSocket::from_std(std_sock)?);
                let local = sock.local_addr()?;
                *state = UdpState::Bound { sock: Arc::clone(&sock), local, peer: None };
                Ok(sock)
            }
            _ => Err(SockError::InvalidArgument),
        }
    }

    /// Datagram transfers on a never-bound socket bind the wildcard
    /// address implicitly.
    fn ensure_bound(&self, state: &mut UdpState) -> SockResult<Arc<UdpSocket>> {
        match state {
            UdpState::Fresh => self.bind_locked(state, wildcard(self.family)),
            UdpState::Bound { sock, .. } => Ok(Arc::clone(sock)),
            UdpState::Closed => Err(SockError::InvalidHandle),
        }
    }
}

impl ProviderSocket for UdpSock {
    fn issue_bind(&self, addr: SocketAddr, _ctx: &Arc<OpContext>) -> Issue {
        let mut state = self.state.lock().unwrap();
        match self.bind_locked(&mut state, addr) {
            Ok(_) => Issue::ok(0),
            Err(e) => Issue::failed(e),
        }
    }

    fn issue_connect(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let mut state = self.state.lock().unwrap();
        let sock = match self.ensure_bound(&mut state) {
            Ok(sock) => sock,
            Err(e) => return Issue::failed(e),
        };
        drop(state);

        let shared = Arc::clone(&self.state);
        spawn_op(&self.handle, ctx, async move {
            match sock.connect(addr).await {
                Ok(()) => {
                    if let UdpState::Bound { peer, .. } = &mut *shared.lock().unwrap() {
                        *peer = Some(addr);
                    }
                    (Ok(()), 0, OpPayload::None)
                }
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn issue_send(&self, data: Bytes, ctx: &Arc<OpContext>) -> Issue {
        let sock = match &*self.state.lock().unwrap() {
            UdpState::Bound { sock, peer: Some(_), .. } => Arc::clone(sock),
            UdpState::Bound { .. } | UdpState::Fresh => {
                return Issue::failed(SockError::NotConnected)
            }
            UdpState::Closed => return Issue::failed(SockError::InvalidHandle),
        };
        spawn_op(&self.handle, ctx, async move {
            match sock.send(&data).await {
                Ok(n) => (Ok(()), n, OpPayload::None),
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn issue_recv(&self, mut buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let sock = match &*self.state.lock().unwrap() {
            UdpState::Bound { sock, .. } => Arc::clone(sock),
            UdpState::Fresh => return Issue::failed(SockError::NotConnected),
            UdpState::Closed => return Issue::failed(SockError::InvalidHandle),
        };
        spawn_op(&self.handle, ctx, async move {
            match sock.recv(&mut buf).await {
                Ok(n) => {
                    buf.truncate(n);
                    (Ok(()), n, OpPayload::Data(buf.freeze()))
                }
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn issue_send_to(&self, data: Bytes, peer: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let mut state = self.state.lock().unwrap();
        let sock = match self.ensure_bound(&mut state) {
            Ok(sock) => sock,
            Err(e) => return Issue::failed(e),
        };
        drop(state);
        spawn_op(&self.handle, ctx, async move {
            match sock.send_to(&data, peer).await {
                Ok(n) => (Ok(()), n, OpPayload::None),
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn issue_recv_from(&self, mut buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let sock = match &*self.state.lock().unwrap() {
            UdpState::Bound { sock, .. } => Arc::clone(sock),
            UdpState::Fresh => return Issue::failed(SockError::NotConnected),
            UdpState::Closed => return Issue::failed(SockError::InvalidHandle),
        };
        spawn_op(&self.handle, ctx, async move {
            match sock.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    buf.truncate(n);
                    (Ok(()), n, OpPayload::Datagram(buf.freeze(), peer))
                }
                Err(e) => (Err(e.into()), 0, OpPayload::None),
            }
        });
        Issue::Pending
    }

    fn local_addr(&self) -> SockResult<SocketAddr> {
        match &*self.state.lock().unwrap() {
            UdpState::Bound { local, .. } => Ok(*local),
            _ => Err(SockError::NotConnected),
        }
    }

    fn peer_addr(&self) -> SockResult<SocketAddr> {
        match &*self.state.lock().unwrap() {
            UdpState::Bound { peer: Some(peer), .. } => Ok(*peer),
            _ => Err(SockError::NotConnected),
        }
    }

    fn set_raw_option(&self, level: i32, name: i32, value: &[u8]) -> SockResult<()> {
        let state = self.state.lock().unwrap();
        match (&*state, level, name) {
            (UdpState::Bound { sock, .. }, IPPROTO_IP, IP_TTL) => {
                sock.set_ttl(decode_u32(value)?)?;
                Ok(())
            }
            (UdpState::Bound { sock, .. }, SOL_SOCKET, SO_BROADCAST) => {
                sock.set_broadcast(decode_u32(value)? != 0)?;
                Ok(())
            }
            _ => Err(SockError::UnsupportedForClass),
        }
    }

    fn get_raw_option(&self, level: i32, name: i32) -> SockResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        match (&*state, level, name) {
            (UdpState::Bound { sock, .. }, IPPROTO_IP, IP_TTL) => Ok(encode_u32(sock.ttl()?)),
            (UdpState::Bound { sock, .. }, SOL_SOCKET, SO_BROADCAST) => {
                Ok(encode_u32(sock.broadcast()? as u32))
            }
            _ => Err(SockError::UnsupportedForClass),
        }
    }

    fn ioctl(&self, code: u32, input: &[u8]) -> SockResult<Vec<u8>> {
        ioctl_fionbio(code, input)
    }

    fn close(&self) {
        *self.state.lock().unwrap() = UdpState::Closed;
    }
}

/// Engine generations. `Modern` exposes the unified stream object;
/// `Legacy` only hands out split listen/connection objects, forcing the
/// compatibility adapter into play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineGeneration {
    Modern,
    Legacy,
}

/// The tokio-backed engine. Owns its runtime; operations complete on
/// the runtime's worker threads, concurrently with and independently of
/// the issuing thread.
pub struct TokioEngine {
    rt: Runtime,
    generation: EngineGeneration,
}

impl std::fmt::Debug for TokioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioEngine").field("generation", &self.generation).finish()
    }
}

impl TokioEngine {
    pub fn new() -> SockResult<Self> {
        Self::with_generation(EngineGeneration::Modern)
    }

    /// An engine that behaves like an older release without the unified
    /// stream abstraction.
    pub fn legacy() -> SockResult<Self> {
        Self::with_generation(EngineGeneration::Legacy)
    }

    pub fn with_generation(generation: EngineGeneration) -> SockResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("sockbridge-engine")
            .build()
            .map_err(|_| SockError::ResourceExhausted)?;
        Ok(Self { rt, generation })
    }

    fn handle(&self) -> Handle {
        self.rt.handle().clone()
    }
}

impl Engine for TokioEngine {
    fn provider_info(&self) -> ProviderInfo {
        match self.generation {
            EngineGeneration::Modern => ProviderInfo {
                highest_version: make_version(2, 0),
                lowest_version: make_version(1, 0),
            },
            EngineGeneration::Legacy => ProviderInfo {
                highest_version: make_version(1, 0),
                lowest_version: make_version(1, 0),
            },
        }
    }

    fn supports_unified_stream(&self) -> bool {
        self.generation == EngineGeneration::Modern
    }

    fn stream_socket(&self, family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>> {
        if !self.supports_unified_stream() {
            return Err(SockError::UnsupportedForClass);
        }
        Ok(Arc::new(TcpSock::fresh(self.handle(), family)))
    }

    fn listen_socket(&self, family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>> {
        Ok(Arc::new(TcpSock::fresh(self.handle(), family)))
    }

    fn connection_socket(&self, family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>> {
        Ok(Arc::new(TcpSock::fresh(self.handle(), family)))
    }

    fn datagram_socket(&self, family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>> {
        Ok(Arc::new(UdpSock::fresh(self.handle(), family)))
    }
}
