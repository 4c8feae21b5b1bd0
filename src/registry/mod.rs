//! Socket handle registry.
//!
//! Concurrent ordered index from caller-visible handles to socket
//! entries. One mutex guards the whole table; critical sections do
//! nothing but the index operation itself, never I/O and never a
//! blocking wait, so a thread stuck in a slow engine call can never
//! hold up table mutation from other threads. Lookups hand back a full
//! copy of the entry (the endpoint is reference counted), taken under
//! the lock, used after it.

use crate::base::{RawSocket, SocketClass, TimeoutMs, INFINITE_WAIT, INVALID_SOCKET};
use crate::socket::Endpoint;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// First handle ever allocated.
const FIRST_HANDLE: RawSocket = 4;
/// Handles advance by a fixed stride, leaving the low values and the
/// gaps unallocated forever.
const HANDLE_STRIDE: RawSocket = 4;

/// One live socket. Exactly one entry maps to exactly one endpoint.
#[derive(Clone)]
pub struct SocketEntry {
    pub endpoint: Arc<dyn Endpoint>,
    pub class: SocketClass,
    pub send_timeout: TimeoutMs,
    pub recv_timeout: TimeoutMs,
}

impl std::fmt::Debug for SocketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEntry")
            .field("class", &self.class)
            .field("send_timeout", &self.send_timeout)
            .field("recv_timeout", &self.recv_timeout)
            .finish()
    }
}

struct TableInner {
    entries: BTreeMap<RawSocket, SocketEntry>,
    next_handle: RawSocket,
}

/// The handle table. Capacity-bounded: the entries live in a fixed
/// budget, and running out is a resource error, not a crash.
pub struct SocketTable {
    inner: Mutex<TableInner>,
    capacity: usize,
}

impl std::fmt::Debug for SocketTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTable")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl SocketTable {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: BTreeMap::new(),
                next_handle: FIRST_HANDLE,
            }),
            capacity,
        }
    }

    /// Insert a new socket and mint its handle.
    ///
    /// Handle generation is monotonic, so the collision retry only ever
    /// fires after the counter wraps the full handle space; it retries
    /// a bounded number of steps before reporting exhaustion.
    pub fn insert(
        &self,
        endpoint: Arc<dyn Endpoint>,
        class: SocketClass,
    ) -> Option<RawSocket> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= self.capacity {
            tracing::debug!(capacity = self.capacity, "socket table full");
            return None;
        }

        let mut attempts = self.capacity + 1;
        loop {
            let handle = inner.next_handle;
            inner.next_handle = bump(handle);
            if !inner.entries.contains_key(&handle) {
                inner.entries.insert(
                    handle,
                    SocketEntry {
                        endpoint,
                        class,
                        send_timeout: INFINITE_WAIT,
                        recv_timeout: INFINITE_WAIT,
                    },
                );
                return Some(handle);
            }
            attempts -= 1;
            if attempts == 0 {
                return None;
            }
        }
    }

    /// Copy out the entry for a handle.
    pub fn find(&self, handle: RawSocket) -> Option<SocketEntry> {
        self.inner.lock().unwrap().entries.get(&handle).cloned()
    }

    /// Update the registry-resident timeouts. Only those two fields are
    /// mutable after insertion.
    pub fn update_timeouts(
        &self,
        handle: RawSocket,
        send_timeout: Option<TimeoutMs>,
        recv_timeout: Option<TimeoutMs>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(&handle) {
            Some(entry) => {
                if let Some(t) = send_timeout {
                    entry.send_timeout = t;
                }
                if let Some(t) = recv_timeout {
                    entry.recv_timeout = t;
                }
                true
            }
            None => false,
        }
    }

    /// Remove a handle, returning its entry so the caller can close the
    /// endpoint outside the lock.
    pub fn delete(&self, handle: RawSocket) -> Option<SocketEntry> {
        self.inner.lock().unwrap().entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every entry, for final teardown.
    pub fn drain(&self) -> Vec<(RawSocket, SocketEntry)> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.entries).into_iter().collect()
    }
}

fn bump(handle: RawSocket) -> RawSocket {
    let next = handle.wrapping_add(HANDLE_STRIDE);
    // Never mint the invalid handle or the reserved low range.
    if next == INVALID_SOCKET & !(HANDLE_STRIDE - 1) || next < FIRST_HANDLE {
        FIRST_HANDLE
    } else {
        next
    }
}
