//! Caller-owned overlapped result records.
//!
//! An overlapped call returns immediately; its outcome lands in the
//! [`OverlappedResult`] the caller supplied, which must outlive the
//! call. Variable-length results (received payloads, datagram sources)
//! are delivered into the record's payload slot — ownership passes to
//! the caller instead of the engine writing into caller memory behind
//! its back. One record observes one operation; allocate a fresh one
//! per call.

use crate::base::{SockResult, TimeoutMs, INFINITE_WAIT};
use crate::bridge::context::{OpPayload, OverlappedShared};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Observation side of one in-flight overlapped operation.
///
/// Status, byte count, and payload must not be inspected until
/// [`is_complete`](Self::is_complete) reports true or a wait returns;
/// the accessors enforce that by returning `None` early.
#[derive(Debug, Default)]
pub struct OverlappedResult {
    shared: Arc<OverlappedShared>,
}

impl OverlappedResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn shared(&self) -> Arc<OverlappedShared> {
        Arc::clone(&self.shared)
    }

    /// Whether the operation has truly completed. Completion implies
    /// the registered callback, if any, has already run.
    pub fn is_complete(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    /// Block until the operation completes.
    pub fn wait(&self) {
        self.shared.event.wait();
    }

    /// Block up to `timeout` milliseconds; returns whether the
    /// operation completed.
    pub fn wait_timeout(&self, timeout: TimeoutMs) -> bool {
        if timeout == INFINITE_WAIT {
            self.wait();
            return true;
        }
        self.shared.event.wait_timeout(Duration::from_millis(u64::from(timeout)))
    }

    /// Final `(status, bytes)` once complete.
    pub fn outcome(&self) -> Option<(SockResult<()>, usize)> {
        if !self.is_complete() {
            return None;
        }
        self.shared.outcome.lock().unwrap().map(|o| (o.status, o.bytes))
    }

    /// Take the received payload of a completed receive. Yields the
    /// bytes once; repeated calls return `None`.
    pub fn take_data(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut payload = self.shared.payload.lock().unwrap();
        match std::mem::take(&mut *payload) {
            OpPayload::Data(data) => Some(data),
            OpPayload::Datagram(data, peer) => {
                // Keep the source address observable after the bytes
                // are taken.
                *payload = OpPayload::Datagram(Bytes::new(), peer);
                Some(data)
            }
            other => {
                // Not a data-bearing completion; put it back.
                *payload = other;
                None
            }
        }
    }

    /// Source address of a completed `recv_from`.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        if !self.is_complete() {
            return None;
        }
        match &*self.shared.payload.lock().unwrap() {
            OpPayload::Datagram(_, peer) => Some(*peer),
            _ => None,
        }
    }
}
