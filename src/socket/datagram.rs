//! Datagram endpoint: a passthrough over one engine datagram object.

use crate::base::SockResult;
use crate::bridge::context::OpContext;
use crate::engine::{Issue, ProviderSocket};
use crate::socket::Endpoint;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug)]
pub struct DatagramEndpoint {
    sock: Arc<dyn ProviderSocket>,
}

impl DatagramEndpoint {
    pub fn new(sock: Arc<dyn ProviderSocket>) -> Self {
        Self { sock }
    }
}

impl Endpoint for DatagramEndpoint {
    fn bind(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_bind(addr, ctx)
    }

    /// Datagram connect fixes the default peer; sends and receives then
    /// work without an explicit address.
    fn connect(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_connect(addr, ctx)
    }

    fn send(&self, data: Bytes, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_send(data, ctx)
    }

    fn recv(&self, buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_recv(buf, ctx)
    }

    fn send_to(&self, data: Bytes, peer: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_send_to(data, peer, ctx)
    }

    fn recv_from(&self, buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        self.sock.issue_recv_from(buf, ctx)
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
