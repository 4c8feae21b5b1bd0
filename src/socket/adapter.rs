//! Stream endpoints over one or two engine objects.
//!
//! Modern engines give us one object that can bind, then either listen
//! or connect. Older engine generations split that into a listening
//! object and a connection object; [`CompositeStream`] hides the split
//! behind one handle with a tri-state binding mode that is set exactly
//! once and never revisited.

use crate::base::{SockError, SockResult};
use crate::bridge::context::OpContext;
use crate::engine::{Issue, ProviderSocket};
use crate::socket::Endpoint;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Passthrough stream endpoint over a unified engine object. Also wraps
/// the connection objects minted by `accept`, which are born connected.
#[derive(Debug)]
pub struct UnifiedStream {
    sock: Arc<dyn ProviderSocket>,
}

impl UnifiedStream {
    pub fn new(sock: Arc<dyn ProviderSocket>) -> Self {
        Self { sock }
    }
}

impl Endpoint for UnifiedStream {
    fn bind(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_bind(addr, ctx)
    }

    fn listen(&self, backlog: u32, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_listen(backlog, ctx)
    }

    fn connect(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_connect(addr, ctx)
    }

    fn accept(&self, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_accept(ctx)
    }

    fn send(&self, data: Bytes, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_send(data, ctx)
    }

    fn recv(&self, buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_recv(buf, ctx)
    }

    fn disconnect(&self, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_disconnect(ctx)
    }

    fn local_addr(&self) -> SockResult<SocketAddr> {
        self.sock.local_addr()
    }

    fn peer_addr(&self) -> SockResult<SocketAddr> {
        self.sock.peer_addr()
    }

    fn set_raw_option(&self, level: i32, name: i32, value: &[u8]) -> SockResult<()> {
        self.sock.set_raw_option(level, name, value)
    }

    fn get_raw_option(&self, level: i32, name: i32) -> SockResult<Vec<u8>> {
        self.sock.get_raw_option(level, name)
    }

    fn ioctl(&self, code: u32, input: &[u8]) -> SockResult<Vec<u8>> {
        self.sock.ioctl(code, input)
    }

    fn close(&self) {
        self.sock.close();
    }
}

/// Which way a composite stream socket was committed. Committed at most
/// once; a commit is rolled back only when the committing call itself
/// fails without ever starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Listening,
    Connected,
}

/// Legacy-engine stream endpoint: one logical socket over a listening
/// object and a connection object. At most one of the two is ever used
/// for I/O once the mode is set; a call against the wrong mode fails
/// loudly instead of silently hitting the wrong object.
#[derive(Debug)]
pub struct CompositeStream {
    listener: Arc<dyn ProviderSocket>,
    connector: Arc<dyn ProviderSocket>,
    mode: Mutex<Option<BindMode>>,
}

impl CompositeStream {
    pub fn new(listener: Arc<dyn ProviderSocket>, connector: Arc<dyn ProviderSocket>) -> Self {
        Self { listener, connector, mode: Mutex::new(None) }
    }

    pub fn mode(&self) -> Option<BindMode> {
        *self.mode.lock().unwrap()
    }

    /// Claim the mode for `want`. Fails if any mode is already
    /// committed; only the claiming call may roll back.
    fn try_commit(&self, want: BindMode) -> bool {
        let mut mode = self.mode.lock().unwrap();
        if mode.is_none() {
            *mode = Some(want);
            true
        } else {
            false
        }
    }

    /// Undo a commit whose issuing call failed inline. The socket goes
    /// back to unbound so the caller can retry either way. An operation
    /// that went pending and failed later keeps the mode; the provider
    /// object has been touched by then.
    fn rollback(&self, want: BindMode) {
        let mut mode = self.mode.lock().unwrap();
        if *mode == Some(want) {
            *mode = None;
        }
    }
}

impl Endpoint for CompositeStream {
    fn bind(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        // Before a mode is chosen the listening object is the socket's
        // face; once connected, the connection object is.
        match self.mode() {
            None | Some(BindMode::Listening) => self.listener.issue_bind(addr, ctx),
            Some(BindMode::Connected) => self.connector.issue_bind(addr, ctx),
        }
    }

    fn listen(&self, backlog: u32, ctx: &Arc<OpContext>) -> Issue {
        if !self.try_commit(BindMode::Listening) {
            tracing::debug!(mode = ?self.mode(), "listen on already-committed composite socket");
            return Issue::failed(SockError::UnsupportedForClass);
        }
        let issue = self.listener.issue_listen(backlog, ctx);
        if let Issue::Complete { status: Err(_), .. } = issue {
            self.rollback(BindMode::Listening);
        }
        issue
    }

    fn connect(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        if !self.try_commit(BindMode::Connected) {
            tracing::debug!(mode = ?self.mode(), "connect on already-committed composite socket");
            return Issue::failed(SockError::UnsupportedForClass);
        }
        let issue = self.connector.issue_connect(addr, ctx);
        if let Issue::Complete { status: Err(_), .. } = issue {
            self.rollback(BindMode::Connected);
        }
        issue
    }

    fn accept(&self, ctx: &Arc<OpContext>) -> Issue {
        match self.mode() {
            None | Some(BindMode::Listening) => self.listener.issue_accept(ctx),
            Some(BindMode::Connected) => Issue::failed(SockError::UnsupportedForClass),
        }
    }

    fn send(&self, data: Bytes, ctx: &Arc<OpContext>) -> Issue {
        match self.mode() {
            Some(BindMode::Connected) => self.connector.issue_send(data, ctx),
            _ => Issue::failed(SockError::UnsupportedForClass),
        }
    }

    fn recv(&self, buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        match self.mode() {
            Some(BindMode::Connected) => self.connector.issue_recv(buf, ctx),
            _ => Issue::failed(SockError::UnsupportedForClass),
        }
    }

    fn disconnect(&self, ctx: &Arc<OpContext>) -> Issue {
        match self.mode() {
            Some(BindMode::Connected) => self.connector.issue_disconnect(ctx),
            _ => Issue::failed(SockError::UnsupportedForClass),
        }
    }

    fn local_addr(&self) -> SockResult<SocketAddr> {
        match self.mode() {
            Some(BindMode::Connected) => self.connector.local_addr(),
            _ => self.listener.local_addr(),
        }
    }

    fn peer_addr(&self) -> SockResult<SocketAddr> {
        match self.mode() {
            Some(BindMode::Connected) => self.connector.peer_addr(),
            _ => Err(SockError::NotConnected),
        }
    }

    fn set_raw_option(&self, level: i32, name: i32, value: &[u8]) -> SockResult<()> {
        match self.mode() {
            Some(BindMode::Connected) => self.connector.set_raw_option(level, name, value),
            _ => self.listener.set_raw_option(level, name, value),
        }
    }

    fn get_raw_option(&self, level: i32, name: i32) -> SockResult<Vec<u8>> {
        match self.mode() {
            Some(BindMode::Connected) => self.connector.get_raw_option(level, name),
            _ => self.listener.get_raw_option(level, name),
        }
    }

    fn close(&self) {
        self.listener.close();
        self.connector.close();
    }
}
