//! Buffer pinning for in-flight operations.
//!
//! An asynchronous engine completes operations on its own threads, long
//! after the issuing call frame is gone. A [`PinnedBuffer`] gives each
//! operation an owned, address-stable descriptor for the caller's input
//! range; [`pin_output`] builds the engine-owned scratch a receive is
//! completed into.

use crate::base::{SockError, SockResult};
use bytes::{Bytes, BytesMut};

/// Upper bound on a single pinned range. Standing in for the engine's
/// page-lock budget; larger requests fail as `ResourceExhausted` before
/// any descriptor state is built.
pub const MAX_PIN_BYTES: usize = 16 * 1024 * 1024;

/// An owned, address-stable descriptor for one caller input buffer.
///
/// Unpinning is idempotent; an empty descriptor is valid. The descriptor
/// is the only reference the engine holds, so keeping it alive inside
/// the operation context is what keeps the memory valid across
/// suspension.
#[derive(Debug, Default)]
pub struct PinnedBuffer {
    inner: Option<Bytes>,
}

impl PinnedBuffer {
    /// A descriptor for "no buffer". Used by operations without a data
    /// payload (connect, disconnect, listen).
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Pin a caller input range by capturing it.
    pub fn pin(data: &[u8]) -> SockResult<Self> {
        if data.len() > MAX_PIN_BYTES {
            return Err(SockError::ResourceExhausted);
        }
        Ok(Self { inner: Some(Bytes::copy_from_slice(data)) })
    }

    /// Pin an already-resident buffer.
    ///
    /// Some callers hand us memory that is already stable and shared
    /// (`Bytes` is reference counted); the capture step is skipped and
    /// only descriptor bookkeeping happens. This fast path must stay:
    /// one engine generation hands back payloads it owns, and re-copying
    /// them would double the transfer cost.
    pub fn pin_resident(data: Bytes) -> SockResult<Self> {
        if data.len() > MAX_PIN_BYTES {
            return Err(SockError::ResourceExhausted);
        }
        Ok(Self { inner: Some(data) })
    }

    /// Bytes available to the engine.
    pub fn input(&self) -> Bytes {
        self.inner.clone().unwrap_or_default()
    }

    /// Release the pin. Idempotent and safe on a never-pinned
    /// descriptor.
    pub fn unpin(&mut self) {
        self.inner = None;
    }
}

/// Build an output descriptor of `len` bytes for the engine to fill.
///
/// The receive path hands this to the provider, which truncates it to
/// the transfer count and freezes it into the completion payload.
pub fn pin_output(len: usize) -> SockResult<BytesMut> {
    if len > MAX_PIN_BYTES {
        return Err(SockError::ResourceExhausted);
    }
    let mut buf = BytesMut::with_capacity(len);
    buf.resize(len, 0);
    Ok(buf)
}

/// Copy received bytes back into the caller's slice, returning how many
/// were written. The transfer count can exceed the slice only if the
/// engine misbehaved; the copy is clamped either way.
pub fn copy_back(received: &Bytes, dst: &mut [u8]) -> usize {
    let n = received.len().min(dst.len());
    dst[..n].copy_from_slice(&received[..n]);
    n
}
