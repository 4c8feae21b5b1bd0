//! Synchronous Berkeley-style socket surface.
//!
//! [`NetStack`] composes the handle registry, the context pool, the
//! completion bridge, and an engine into the familiar blocking calls:
//! `socket`, `bind`, `listen`, `accept`, `connect`, `send`, `recv` and
//! friends. Callers never see an async type; each data-transfer call
//! optionally takes an [`OverlappedResult`] to run asynchronously
//! instead of blocking.

pub mod overlapped;
pub mod stack;

#[cfg(test)]
mod tests;

pub use overlapped::OverlappedResult;
pub use stack::NetStack;

use crate::base::SocketClass;

/// Operations subject to per-class dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Bind,
    Listen,
    Accept,
    Connect,
    Disconnect,
    Send,
    Recv,
    SendTo,
    RecvFrom,
}

/// Fixed dispatch table: which operations each socket class admits.
/// A rejected pair fails with `UnsupportedForClass` before the engine
/// is ever consulted.
pub(crate) const fn allowed(class: SocketClass, op: OpKind) -> bool {
    use OpKind::*;
    matches!(
        (class, op),
        (SocketClass::Stream, Bind | Listen | Accept | Connect | Disconnect | Send | Recv)
            | (SocketClass::Listen, Bind | Listen | Accept)
            | (SocketClass::Connection, Bind | Connect | Disconnect | Send | Recv)
            | (SocketClass::Datagram, Bind | Connect | Send | Recv | SendTo | RecvFrom)
    )
}
