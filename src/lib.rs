//! sockbridge: a synchronous Berkeley-style socket API over an
//! asynchronous completion-driven engine.
//!
//! The crate is organized in layers:
//! - [`base`]: error taxonomy, handle and timeout primitives
//! - [`bridge`]: buffer pinning, per-operation contexts, the completion
//!   demultiplexer, and blocking-wait/timeout control
//! - [`registry`]: the capacity-bounded socket handle table
//! - [`engine`]: the provider abstraction and the tokio-backed engine
//! - [`socket`]: endpoint adapters, including the composite wrapper for
//!   engine generations without a unified stream object
//! - [`berkeley`]: the blocking call surface, [`NetStack`]
//!
//! ```no_run
//! use sockbridge::{AddressFamily, NetStack, SocketKind, TokioEngine};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), sockbridge::SockError> {
//! let engine = Arc::new(TokioEngine::new()?);
//! let stack = NetStack::new(engine);
//! stack.startup(sockbridge::engine::make_version(2, 0))?;
//!
//! let s = stack.socket(AddressFamily::Ipv4, SocketKind::Stream)?;
//! stack.connect(s, "127.0.0.1:7000".parse().unwrap())?;
//! let sent = stack.send(s, b"hello", 0, None, None)?;
//! stack.close(s)?;
//! stack.shutdown()?;
//! # let _ = sent;
//! # Ok(())
//! # }
//! ```

pub mod base;
pub mod berkeley;
pub mod bridge;
pub mod engine;
pub mod registry;
pub mod socket;

pub use base::{
    AddressFamily, RawSocket, SockError, SockResult, SocketClass, SocketKind, SocketOption,
    TimeoutMs, TransferFlags, INFINITE_WAIT, INVALID_SOCKET,
};
pub use berkeley::{NetStack, OverlappedResult};
pub use bridge::context::CompletionCallback;
pub use engine::tokio_engine::TokioEngine;
pub use engine::ProviderInfo;
