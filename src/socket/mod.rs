//! Endpoint abstraction and provider-version compatibility.
//!
//! The facade never talks to engine objects directly; it talks to a
//! [`Endpoint`] — a "bindable network endpoint". On modern engines a
//! stream endpoint is a passthrough over one unified object
//! ([`adapter::UnifiedStream`]); on legacy engines it is a composite of
//! separate listening and connection objects with a once-set binding
//! mode ([`adapter::CompositeStream`]). Datagram sockets are always
//! [`datagram::DatagramEndpoint`].

pub mod adapter;
pub mod datagram;

use crate::base::{SockError, SockResult};
use crate::bridge::context::OpContext;
use crate::engine::Issue;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;

/// One caller-visible socket's operation surface.
///
/// Default bodies reject the operation; each implementation overrides
/// the rows its socket supports, mirroring the per-class dispatch
/// tables of the engine.
pub trait Endpoint: Send + Sync + std::fmt::Debug {
    fn bind(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let _ = (addr, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn listen(&self, backlog: u32, ctx: &Arc<OpContext>) -> Issue {
        let _ = (backlog, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn connect(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let _ = (addr, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn accept(&self, ctx: &Arc<OpContext>) -> Issue {
        let _ = ctx;
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn send(&self, data: Bytes, ctx: &Arc<OpContext>) -> Issue {
        let _ = (data, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn recv(&self, buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let _ = (buf, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn send_to(&self, data: Bytes, peer: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let _ = (data, peer, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn recv_from(&self, buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let _ = (buf, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn disconnect(&self, ctx: &Arc<OpContext>) -> Issue {
        let _ = ctx;
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn local_addr(&self) -> SockResult<SocketAddr> {
        Err(SockError::NotConnected)
    }

    fn peer_addr(&self) -> SockResult<SocketAddr> {
        Err(SockError::NotConnected)
    }

    fn set_raw_option(&self, level: i32, name: i32, value: &[u8]) -> SockResult<()> {
        let _ = (level, name, value);
        Err(SockError::UnsupportedForClass)
    }

    fn get_raw_option(&self, level: i32, name: i32) -> SockResult<Vec<u8>> {
        let _ = (level, name);
        Err(SockError::UnsupportedForClass)
    }

    fn ioctl(&self, code: u32, input: &[u8]) -> SockResult<Vec<u8>> {
        let _ = (code, input);
        Err(SockError::InvalidArgument)
    }

    /// Release the underlying engine object(s). Idempotent.
    fn close(&self) {}
}
