//! Base types and error handling.
//!
//! Foundational definitions shared by every layer of the bridge:
//! - [`SockError`]: the crate-wide error taxonomy with stable codes
//! - handle, class, and timeout primitives for the registry and facade

pub mod error;

pub use error::{SockError, SockResult};

/// Caller-visible socket handle. Small, opaque, never reused while live.
pub type RawSocket = u32;

/// Reserved "no socket" value; never allocated by the registry.
pub const INVALID_SOCKET: RawSocket = !0;

/// Blocking-wait timeout in milliseconds.
pub type TimeoutMs = u32;

/// Wait forever. The default send/receive timeout for new sockets.
pub const INFINITE_WAIT: TimeoutMs = TimeoutMs::MAX;

/// Address family for socket creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// What the caller asked for at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Registry-resident socket class, driving the operation dispatch table.
///
/// `Stream` covers both a unified engine stream object and the legacy
/// composite wrapper; `Connection` is the class of sockets minted by
/// `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketClass {
    Stream,
    Datagram,
    Listen,
    Connection,
}

/// Socket options understood by the facade.
///
/// The two timeout options are registry-resident state and never reach
/// the engine; everything else is an opaque (level, name) passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    SendTimeout,
    ReceiveTimeout,
    Raw { level: i32, name: i32 },
}

/// Flags accepted by the data-transfer calls. No flag bits are defined
/// yet; non-zero values are rejected with `InvalidArgument` at the
/// facade boundary.
pub type TransferFlags = u32;
