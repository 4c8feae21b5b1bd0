//! Per-operation bookkeeping records.
//!
//! Every call that can suspend gets one [`OpContext`]: it owns the
//! pinned buffers, the waiter (an internal event for blocking calls or
//! the caller's overlapped record plus optional callback), and the
//! cooperative cancel token the engine races against. Contexts are
//! handed out by a bounded [`ContextPool`] whose in-flight accounting
//! doubles as the leak detector in tests.
//!
//! Lifecycle: `Created -> Issued -> {CompletedSync | CompletedAsync} ->
//! Retired`. Retirement happens exactly once, enforced by an atomic
//! guard, on whichever path observed the true completion.

use crate::base::{SockError, SockResult};
use crate::bridge::pin::PinnedBuffer;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Completion callback for overlapped calls: `(status, bytes)`.
pub type CompletionCallback = Box<dyn FnOnce(SockResult<()>, usize) + Send + 'static>;

/// Variable-length results travel in this slot rather than in the byte
/// count: accepted connections, datagram sources, received payloads.
#[derive(Debug, Default)]
pub enum OpPayload {
    #[default]
    None,
    /// Received bytes (truncated to the transfer count).
    Data(Bytes),
    /// Received bytes plus the datagram source address.
    Datagram(Bytes, SocketAddr),
    /// A freshly accepted engine socket and its peer address.
    Accepted(Arc<dyn crate::engine::ProviderSocket>, SocketAddr),
}

/// Final status of one operation.
#[derive(Debug, Clone, Copy)]
pub struct OpOutcome {
    pub status: SockResult<()>,
    pub bytes: usize,
}

/// Manual-reset completion event, the blocking caller's suspension
/// point. Signaling is sticky: a wait that starts after the signal
/// returns immediately.
#[derive(Debug, Default)]
pub struct CompletionEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.condvar.notify_all();
    }

    /// Wait with no deadline.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.condvar.wait(signaled).unwrap();
        }
    }

    /// Wait up to `timeout`; returns whether the event fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.condvar.wait_timeout(signaled, deadline - now).unwrap();
            signaled = guard;
            if result.timed_out() && !*signaled {
                return false;
            }
        }
        true
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }
}

/// Cooperative cancellation: requesting cancel never completes the
/// operation by itself, it only asks the engine to finish early. The
/// true completion still arrives through the bridge.
#[derive(Debug, Default)]
pub struct CancelToken {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested. The notified
    /// future is registered before the flag check to close the gap
    /// between a concurrent `request` and this wait.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Who is waiting on this operation.
pub enum Waiter {
    /// Pure blocking call: the issuer sleeps on the internal event and
    /// reads the result out of the context itself.
    Blocking(CompletionEvent),
    /// Overlapped call: results are published into the caller-owned
    /// record, optionally through a completion callback first.
    Overlapped {
        shared: Arc<OverlappedShared>,
        callback: Mutex<Option<CompletionCallback>>,
    },
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Waiter::Blocking(_) => f.write_str("Waiter::Blocking"),
            Waiter::Overlapped { .. } => f.write_str("Waiter::Overlapped"),
        }
    }
}

/// Completion-side state of a caller-owned overlapped record. The public
/// `OverlappedResult` in the facade wraps one of these; the bridge
/// publishes into it and signals its event, strictly in that order.
#[derive(Debug, Default)]
pub struct OverlappedShared {
    pub event: CompletionEvent,
    pub done: AtomicBool,
    pub outcome: Mutex<Option<OpOutcome>>,
    pub payload: Mutex<OpPayload>,
}

/// Pinned input owned by one operation. Output ranges are not pinned
/// here; the receive path hands the provider an owned descriptor
/// directly and the result comes back as the completion payload.
#[derive(Debug, Default)]
pub struct PinSet {
    pub input: PinnedBuffer,
}

/// The per-call record that outlives its issuing stack frame.
pub struct OpContext {
    waiter: Waiter,
    cancel: CancelToken,
    outcome: Mutex<Option<OpOutcome>>,
    payload: Mutex<OpPayload>,
    pins: Mutex<PinSet>,
    completed: AtomicBool,
    retired: AtomicBool,
    pool: Arc<ContextPool>,
}

impl std::fmt::Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("waiter", &self.waiter)
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .field("retired", &self.retired.load(Ordering::SeqCst))
            .finish()
    }
}

impl OpContext {
    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    /// Internal completion event; present only on blocking contexts.
    pub fn event(&self) -> Option<&CompletionEvent> {
        match &self.waiter {
            Waiter::Blocking(event) => Some(event),
            Waiter::Overlapped { .. } => None,
        }
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn pins(&self) -> &Mutex<PinSet> {
        &self.pins
    }

    /// Record the final status. Returns false if the operation had
    /// already completed; the bridge treats that as a duplicate
    /// completion and drops it.
    pub(crate) fn record_completion(&self, outcome: OpOutcome, payload: OpPayload) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.outcome.lock().unwrap() = Some(outcome);
        *self.payload.lock().unwrap() = payload;
        true
    }

    /// Drain the recorded result. Valid once, after completion.
    pub(crate) fn take_outcome(&self) -> (OpOutcome, OpPayload) {
        let outcome = self
            .outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or(OpOutcome { status: Err(SockError::Cancelled), bytes: 0 });
        let payload = std::mem::take(&mut *self.payload.lock().unwrap());
        (outcome, payload)
    }

    /// Release the pins and return the context to the pool. Idempotent
    /// by atomic guard; exactly one caller observes `true`.
    pub(crate) fn retire(&self) -> bool {
        if self.retired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.pins.lock().unwrap().input.unpin();
        self.pool.release();
        true
    }
}

impl Drop for OpContext {
    fn drop(&mut self) {
        // Last line of defense for paths that error out between
        // acquisition and issue.
        self.retire();
    }
}

/// Bounded source of operation contexts.
///
/// The bound models the fixed per-call record budget; `in_flight`
/// returning to zero after a workload is the leak check the tests rely
/// on.
#[derive(Debug)]
pub struct ContextPool {
    in_flight: AtomicUsize,
    capacity: usize,
}

impl ContextPool {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { in_flight: AtomicUsize::new(0), capacity })
    }

    /// Allocate a context for one operation.
    pub fn acquire(
        self: &Arc<Self>,
        waiter: Waiter,
        pins: PinSet,
    ) -> SockResult<Arc<OpContext>> {
        let prev = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if prev >= self.capacity {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(capacity = self.capacity, "operation context pool exhausted");
            return Err(SockError::ResourceExhausted);
        }
        Ok(Arc::new(OpContext {
            waiter,
            cancel: CancelToken::default(),
            outcome: Mutex::new(None),
            payload: Mutex::new(OpPayload::None),
            pins: Mutex::new(pins),
            completed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            pool: Arc::clone(self),
        }))
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of contexts currently alive.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
