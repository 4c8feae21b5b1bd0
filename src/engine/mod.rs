//! The provider abstraction.
//!
//! An engine is the underlying network machinery that actually performs
//! socket operations. Its native interface is completion-driven: every
//! operation either finishes inline or goes pending and later funnels
//! through [`crate::bridge::completion::complete`] on an engine thread.
//! The rest of the crate only ever sees this one primitive.
//!
//! [`tokio_engine::TokioEngine`] is the production implementation.

pub mod tokio_engine;

#[cfg(test)]
pub(crate) mod mock;

use crate::base::{AddressFamily, SockError, SockResult};
use crate::bridge::context::OpContext;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;

/// What an `issue_*` call reported at the call site.
#[derive(Debug, Clone, Copy)]
pub enum Issue {
    /// The operation finished without suspending. The completion bridge
    /// was not and will not be invoked for it.
    Complete { status: SockResult<()>, bytes: usize },
    /// The operation is in flight; its true completion arrives through
    /// the bridge, possibly on another thread, possibly after a cancel
    /// request.
    Pending,
}

impl Issue {
    pub fn failed(err: SockError) -> Self {
        Issue::Complete { status: Err(err), bytes: 0 }
    }

    pub fn ok(bytes: usize) -> Self {
        Issue::Complete { status: Ok(()), bytes }
    }
}

/// Version range advertised by an engine, packed `major << 8 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderInfo {
    pub highest_version: u16,
    pub lowest_version: u16,
}

/// Pack a dotted version for [`ProviderInfo`] comparisons.
pub const fn make_version(major: u8, minor: u8) -> u16 {
    ((major as u16) << 8) | minor as u16
}

/// One opaque engine socket object.
///
/// Default method bodies reject the operation for the object's class;
/// implementations override exactly the rows of the per-class dispatch
/// table their object supports. Every `issue_*` takes the operation
/// context so a pending operation can complete and be torn down without
/// its issuing stack frame.
pub trait ProviderSocket: Send + Sync + std::fmt::Debug {
    fn issue_bind(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let _ = (addr, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn issue_listen(&self, backlog: u32, ctx: &Arc<OpContext>) -> Issue {
        let _ = (backlog, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn issue_connect(&self, addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let _ = (addr, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn issue_accept(&self, ctx: &Arc<OpContext>) -> Issue {
        let _ = ctx;
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn issue_send(&self, data: Bytes, ctx: &Arc<OpContext>) -> Issue {
        let _ = (data, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    /// Receive into the caller-pinned output descriptor. The provider
    /// truncates `buf` to the transfer count and completes with it as
    /// the payload.
    fn issue_recv(&self, buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let _ = (buf, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn issue_send_to(&self, data: Bytes, peer: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        let _ = (data, peer, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn issue_recv_from(&self, buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let _ = (buf, ctx);
        Issue::failed(SockError::UnsupportedForClass)
    }

    fn issue_disconnect(&self, ctx: &Arc<OpContext>) -> Issue {
        let _ = ctx;
        Issue::failed(SockError::UnsupportedForClass)
    }

    /// Local address, once bound or connected.
    fn local_addr(&self) -> SockResult<SocketAddr> {
        Err(SockError::NotConnected)
    }

    /// Peer address, once connected.
    fn peer_addr(&self) -> SockResult<SocketAddr> {
        Err(SockError::NotConnected)
    }

    /// Opaque option passthrough. The engine honors whatever codes its
    /// objects understand; everything else is rejected.
    fn set_raw_option(&self, level: i32, name: i32, value: &[u8]) -> SockResult<()> {
        let _ = (level, name, value);
        Err(SockError::UnsupportedForClass)
    }

    fn get_raw_option(&self, level: i32, name: i32) -> SockResult<Vec<u8>> {
        let _ = (level, name);
        Err(SockError::UnsupportedForClass)
    }

    /// Opaque device-control passthrough.
    fn ioctl(&self, code: u32, input: &[u8]) -> SockResult<Vec<u8>> {
        let _ = (code, input);
        Err(SockError::InvalidArgument)
    }

    /// Release the underlying object. Idempotent.
    fn close(&self);
}

/// Factory for per-class engine socket objects.
pub trait Engine: Send + Sync + std::fmt::Debug {
    fn provider_info(&self) -> ProviderInfo;

    /// Whether this engine generation exposes one unified stream object.
    /// When false, stream sockets are built from a separate listening
    /// object and connection object behind the compatibility adapter.
    fn supports_unified_stream(&self) -> bool;

    /// A unified stream object (bind, then either listen or connect).
    fn stream_socket(&self, family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>>;

    /// A listen-only object, for the legacy split path.
    fn listen_socket(&self, family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>>;

    /// A connect-only object, for the legacy split path.
    fn connection_socket(&self, family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>>;

    fn datagram_socket(&self, family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>>;
}
