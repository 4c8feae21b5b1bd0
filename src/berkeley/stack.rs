//! The socket stack facade.
//!
//! One [`NetStack`] owns the engine, the handle table, and the context
//! pool, and exposes the blocking call surface. Every call follows the
//! same shape: resolve the handle to a copied-out entry (the table lock
//! is released before any engine work), check the class dispatch table,
//! acquire a context, issue, then either park on the context's event or
//! hand the caller's overlapped record to the bridge.

use crate::base::{
    AddressFamily, RawSocket, SockError, SockResult, SocketClass, SocketKind, SocketOption,
    TimeoutMs, TransferFlags, INFINITE_WAIT,
};
use crate::berkeley::{allowed, OpKind, OverlappedResult};
use crate::bridge::completion::finish_inline;
use crate::bridge::context::{
    CompletionCallback, CompletionEvent, ContextPool, OpContext, OpPayload, PinSet, Waiter,
};
use crate::bridge::pin::{copy_back, pin_output, PinnedBuffer};
use crate::bridge::wait::{wait_blocking, BlockingOutcome};
use crate::engine::{Engine, Issue, ProviderInfo};
use crate::registry::{SocketEntry, SocketTable};
use crate::socket::adapter::{CompositeStream, UnifiedStream};
use crate::socket::datagram::DatagramEndpoint;
use crate::socket::Endpoint;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Blocking Berkeley-style socket surface over an async engine.
///
/// Thread-safe; share one instance behind an `Arc`. Calls fail with
/// [`SockError::NotInitialized`] until [`startup`](Self::startup) has
/// succeeded.
#[derive(Debug)]
pub struct NetStack {
    engine: Arc<dyn Engine>,
    table: SocketTable,
    contexts: Arc<ContextPool>,
    started: Mutex<u32>,
}

impl NetStack {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_limits(engine, SocketTable::DEFAULT_CAPACITY, ContextPool::DEFAULT_CAPACITY)
    }

    /// Build a stack with explicit table and in-flight operation budgets.
    pub fn with_limits(
        engine: Arc<dyn Engine>,
        table_capacity: usize,
        context_capacity: usize,
    ) -> Self {
        Self {
            engine,
            table: SocketTable::new(table_capacity),
            contexts: ContextPool::new(context_capacity),
            started: Mutex::new(0),
        }
    }

    /// Initialize the stack, negotiating `version` against the engine.
    ///
    /// Refcounted: each successful `startup` must be paired with a
    /// [`shutdown`](Self::shutdown). Returns the engine's supported
    /// version range.
    pub fn startup(&self, version: u16) -> SockResult<ProviderInfo> {
        let info = self.engine.provider_info();
        if version < info.lowest_version || version > info.highest_version {
            tracing::debug!(
                requested = version,
                lowest = info.lowest_version,
                highest = info.highest_version,
                "requested provider version out of range"
            );
            return Err(SockError::InvalidArgument);
        }
        let mut started = self.started.lock().unwrap();
        *started += 1;
        tracing::info!(refcount = *started, "stack started");
        Ok(info)
    }

    /// Drop one startup reference. The final shutdown refuses to
    /// proceed while sockets remain open; close them first.
    pub fn shutdown(&self) -> SockResult<()> {
        let mut started = self.started.lock().unwrap();
        match *started {
            0 => Err(SockError::NotInitialized),
            1 => {
                if !self.table.is_empty() {
                    tracing::warn!(open = self.table.len(), "shutdown refused: sockets still open");
                    return Err(SockError::SocketsStillOpen);
                }
                *started = 0;
                tracing::info!("stack stopped");
                Ok(())
            }
            _ => {
                *started -= 1;
                Ok(())
            }
        }
    }

    fn ensure_started(&self) -> SockResult<()> {
        if *self.started.lock().unwrap() == 0 {
            return Err(SockError::NotInitialized);
        }
        Ok(())
    }

    /// Number of live socket handles.
    pub fn open_sockets(&self) -> usize {
        self.table.len()
    }

    /// Number of operation contexts currently in flight. Returns to
    /// zero once all calls on this stack have fully completed.
    pub fn contexts_in_flight(&self) -> usize {
        self.contexts.in_flight()
    }

    /// Create a socket and mint its handle.
    pub fn socket(&self, family: AddressFamily, kind: SocketKind) -> SockResult<RawSocket> {
        self.ensure_started()?;
        let (endpoint, class): (Arc<dyn Endpoint>, SocketClass) = match kind {
            SocketKind::Datagram => {
                let sock = self.engine.datagram_socket(family)?;
                (Arc::new(DatagramEndpoint::new(sock)), SocketClass::Datagram)
            }
            SocketKind::Stream => {
                let endpoint: Arc<dyn Endpoint> = if self.engine.supports_unified_stream() {
                    Arc::new(UnifiedStream::new(self.engine.stream_socket(family)?))
                } else {
                    // Older engine generations split listening and
                    // connecting into separate objects; the composite
                    // wrapper presents them as one socket.
                    Arc::new(CompositeStream::new(
                        self.engine.listen_socket(family)?,
                        self.engine.connection_socket(family)?,
                    ))
                };
                (endpoint, SocketClass::Stream)
            }
        };
        match self.table.insert(Arc::clone(&endpoint), class) {
            Some(handle) => {
                tracing::debug!(handle, ?family, ?kind, "socket created");
                Ok(handle)
            }
            None => {
                endpoint.close();
                Err(SockError::ResourceExhausted)
            }
        }
    }

    /// Close a socket and release its handle. The handle value is
    /// never reissued.
    pub fn close(&self, handle: RawSocket) -> SockResult<()> {
        self.ensure_started()?;
        let entry = self.table.delete(handle).ok_or(SockError::InvalidHandle)?;
        entry.endpoint.close();
        tracing::debug!(handle, "socket closed");
        Ok(())
    }

    pub fn bind(&self, handle: RawSocket, addr: SocketAddr) -> SockResult<()> {
        self.ensure_started()?;
        let entry = self.checked(handle, OpKind::Bind)?;
        self.blocking_op(INFINITE_WAIT, PinSet::default(), |ctx| entry.endpoint.bind(addr, ctx))?
            .status
    }

    pub fn listen(&self, handle: RawSocket, backlog: u32) -> SockResult<()> {
        self.ensure_started()?;
        let entry = self.checked(handle, OpKind::Listen)?;
        self.blocking_op(INFINITE_WAIT, PinSet::default(), |ctx| {
            entry.endpoint.listen(backlog, ctx)
        })?
        .status
    }

    pub fn connect(&self, handle: RawSocket, addr: SocketAddr) -> SockResult<()> {
        self.ensure_started()?;
        let entry = self.checked(handle, OpKind::Connect)?;
        self.blocking_op(INFINITE_WAIT, PinSet::default(), |ctx| {
            entry.endpoint.connect(addr, ctx)
        })?
        .status
    }

    /// Accept one pending connection; blocks until a peer arrives.
    ///
    /// On success the new connection gets its own handle and entry. If
    /// the table is full the accepted connection is closed again and
    /// the call fails, leaving no orphaned engine object.
    pub fn accept(&self, handle: RawSocket) -> SockResult<(RawSocket, SocketAddr)> {
        self.ensure_started()?;
        let entry = self.checked(handle, OpKind::Accept)?;
        let out =
            self.blocking_op(INFINITE_WAIT, PinSet::default(), |ctx| entry.endpoint.accept(ctx))?;
        out.status?;
        match out.payload {
            OpPayload::Accepted(sock, peer) => {
                let endpoint: Arc<dyn Endpoint> = Arc::new(UnifiedStream::new(sock));
                match self.table.insert(Arc::clone(&endpoint), SocketClass::Connection) {
                    Some(accepted) => {
                        tracing::debug!(handle, accepted, %peer, "connection accepted");
                        Ok((accepted, peer))
                    }
                    None => {
                        endpoint.close();
                        Err(SockError::ResourceExhausted)
                    }
                }
            }
            _ => {
                tracing::warn!(handle, "accept completed without a connection payload");
                Err(SockError::ConnectionAborted)
            }
        }
    }

    /// Orderly send-direction shutdown of a connected stream socket.
    pub fn disconnect(&self, handle: RawSocket) -> SockResult<()> {
        self.ensure_started()?;
        let entry = self.checked(handle, OpKind::Disconnect)?;
        self.blocking_op(INFINITE_WAIT, PinSet::default(), |ctx| entry.endpoint.disconnect(ctx))?
            .status
    }

    /// Send on a connected socket.
    ///
    /// Blocking unless `overlapped` is supplied, in which case the call
    /// returns [`SockError::Pending`] immediately and the outcome lands
    /// in the record (running `callback` first, if given). Blocks up to
    /// the socket's send timeout; on expiry the operation is cancelled
    /// and the call waits for its true completion before returning
    /// [`SockError::Timeout`].
    pub fn send(
        &self,
        handle: RawSocket,
        data: &[u8],
        flags: TransferFlags,
        overlapped: Option<&OverlappedResult>,
        callback: Option<CompletionCallback>,
    ) -> SockResult<usize> {
        self.ensure_started()?;
        check_flags(flags)?;
        let entry = self.checked(handle, OpKind::Send)?;

        let input = PinnedBuffer::pin(data)?;
        let payload = input.input();
        let pins = PinSet { input };

        match overlapped {
            Some(record) => self.overlapped_op(record, callback, pins, |ctx| {
                entry.endpoint.send(payload, ctx)
            }),
            None => {
                reject_bare_callback(callback)?;
                let out = self.blocking_op(entry.send_timeout, pins, |ctx| {
                    entry.endpoint.send(payload, ctx)
                })?;
                out.status?;
                Ok(out.bytes)
            }
        }
    }

    /// Receive from a connected socket into `buf`.
    ///
    /// Same blocking/overlapped split as [`send`](Self::send). For
    /// overlapped calls the payload is not written to `buf`; take it
    /// from the record once complete. A timed-out blocking receive
    /// still copies whatever the delayed completion delivered.
    pub fn recv(
        &self,
        handle: RawSocket,
        buf: &mut [u8],
        flags: TransferFlags,
        overlapped: Option<&OverlappedResult>,
        callback: Option<CompletionCallback>,
    ) -> SockResult<usize> {
        self.ensure_started()?;
        check_flags(flags)?;
        let entry = self.checked(handle, OpKind::Recv)?;

        // The output descriptor travels into the provider, which
        // truncates it to the transfer count and completes with it as
        // the payload.
        let output = pin_output(buf.len())?;

        match overlapped {
            Some(record) => self.overlapped_op(record, callback, PinSet::default(), |ctx| {
                entry.endpoint.recv(output, ctx)
            }),
            None => {
                reject_bare_callback(callback)?;
                let out = self.blocking_op(entry.recv_timeout, PinSet::default(), |ctx| {
                    entry.endpoint.recv(output, ctx)
                })?;
                let copied = match &out.payload {
                    OpPayload::Data(data) => copy_back(data, buf),
                    _ => 0,
                };
                out.status?;
                Ok(copied)
            }
        }
    }

    /// Send a datagram to an explicit destination.
    pub fn send_to(
        &self,
        handle: RawSocket,
        data: &[u8],
        peer: SocketAddr,
        flags: TransferFlags,
        overlapped: Option<&OverlappedResult>,
        callback: Option<CompletionCallback>,
    ) -> SockResult<usize> {
        self.ensure_started()?;
        check_flags(flags)?;
        let entry = self.checked(handle, OpKind::SendTo)?;

        let input = PinnedBuffer::pin(data)?;
        let payload = input.input();
        let pins = PinSet { input };

        match overlapped {
            Some(record) => self.overlapped_op(record, callback, pins, |ctx| {
                entry.endpoint.send_to(payload, peer, ctx)
            }),
            None => {
                reject_bare_callback(callback)?;
                let out = self.blocking_op(entry.send_timeout, pins, |ctx| {
                    entry.endpoint.send_to(payload, peer, ctx)
                })?;
                out.status?;
                Ok(out.bytes)
            }
        }
    }

    /// Receive one datagram and its source address.
    pub fn recv_from(
        &self,
        handle: RawSocket,
        buf: &mut [u8],
        flags: TransferFlags,
        overlapped: Option<&OverlappedResult>,
        callback: Option<CompletionCallback>,
    ) -> SockResult<(usize, SocketAddr)> {
        self.ensure_started()?;
        check_flags(flags)?;
        let entry = self.checked(handle, OpKind::RecvFrom)?;

        let output = pin_output(buf.len())?;

        match overlapped {
            Some(record) => {
                // Source address travels with the payload; read both
                // from the record once complete.
                let bytes = self.overlapped_op(record, callback, PinSet::default(), |ctx| {
                    entry.endpoint.recv_from(output, ctx)
                })?;
                let peer = record.peer_addr().ok_or(SockError::ConnectionAborted)?;
                Ok((bytes, peer))
            }
            None => {
                reject_bare_callback(callback)?;
                let out = self.blocking_op(entry.recv_timeout, PinSet::default(), |ctx| {
                    entry.endpoint.recv_from(output, ctx)
                })?;
                out.status?;
                match out.payload {
                    OpPayload::Datagram(data, peer) => Ok((copy_back(&data, buf), peer)),
                    _ => Err(SockError::ConnectionAborted),
                }
            }
        }
    }

    /// Set a socket option. The two timeout options live in the
    /// registry entry and never touch the engine.
    pub fn set_option(
        &self,
        handle: RawSocket,
        option: SocketOption,
        value: &[u8],
    ) -> SockResult<()> {
        self.ensure_started()?;
        match option {
            SocketOption::SendTimeout => {
                let timeout = decode_timeout(value)?;
                if self.table.update_timeouts(handle, Some(timeout), None) {
                    Ok(())
                } else {
                    Err(SockError::InvalidHandle)
                }
            }
            SocketOption::ReceiveTimeout => {
                let timeout = decode_timeout(value)?;
                if self.table.update_timeouts(handle, None, Some(timeout)) {
                    Ok(())
                } else {
                    Err(SockError::InvalidHandle)
                }
            }
            SocketOption::Raw { level, name } => {
                let entry = self.table.find(handle).ok_or(SockError::InvalidHandle)?;
                entry.endpoint.set_raw_option(level, name, value)
            }
        }
    }

    pub fn get_option(&self, handle: RawSocket, option: SocketOption) -> SockResult<Vec<u8>> {
        self.ensure_started()?;
        let entry = self.table.find(handle).ok_or(SockError::InvalidHandle)?;
        match option {
            SocketOption::SendTimeout => Ok(entry.send_timeout.to_ne_bytes().to_vec()),
            SocketOption::ReceiveTimeout => Ok(entry.recv_timeout.to_ne_bytes().to_vec()),
            SocketOption::Raw { level, name } => entry.endpoint.get_raw_option(level, name),
        }
    }

    /// Opaque device control passthrough to the engine object.
    pub fn ioctl(&self, handle: RawSocket, code: u32, input: &[u8]) -> SockResult<Vec<u8>> {
        self.ensure_started()?;
        let entry = self.table.find(handle).ok_or(SockError::InvalidHandle)?;
        entry.endpoint.ioctl(code, input)
    }

    pub fn local_addr(&self, handle: RawSocket) -> SockResult<SocketAddr> {
        self.ensure_started()?;
        let entry = self.table.find(handle).ok_or(SockError::InvalidHandle)?;
        entry.endpoint.local_addr()
    }

    pub fn peer_addr(&self, handle: RawSocket) -> SockResult<SocketAddr> {
        self.ensure_started()?;
        let entry = self.table.find(handle).ok_or(SockError::InvalidHandle)?;
        entry.endpoint.peer_addr()
    }

    /// Harvest the result of an overlapped call. With `wait` set the
    /// call blocks until the operation completes; otherwise a still
    /// pending operation reports [`SockError::Pending`].
    pub fn wait_overlapped(
        &self,
        handle: RawSocket,
        record: &OverlappedResult,
        wait: bool,
    ) -> SockResult<usize> {
        self.ensure_started()?;
        if self.table.find(handle).is_none() {
            return Err(SockError::InvalidHandle);
        }
        if !record.is_complete() {
            if !wait {
                return Err(SockError::Pending);
            }
            record.wait();
        }
        match record.outcome() {
            Some((status, bytes)) => {
                status?;
                Ok(bytes)
            }
            None => Err(SockError::Pending),
        }
    }

    /// Resolve a handle and apply the class dispatch table. Copies the
    /// entry out so the table lock never covers engine work.
    fn checked(&self, handle: RawSocket, op: OpKind) -> SockResult<SocketEntry> {
        let entry = self.table.find(handle).ok_or(SockError::InvalidHandle)?;
        if !allowed(entry.class, op) {
            tracing::debug!(handle, class = ?entry.class, ?op, "operation not valid for class");
            return Err(SockError::UnsupportedForClass);
        }
        Ok(entry)
    }

    fn blocking_op<F>(&self, timeout: TimeoutMs, pins: PinSet, issue: F) -> SockResult<BlockingOutcome>
    where
        F: FnOnce(&Arc<OpContext>) -> Issue,
    {
        let ctx = self.contexts.acquire(Waiter::Blocking(CompletionEvent::new()), pins)?;
        let issued = issue(&ctx);
        Ok(wait_blocking(ctx, issued, timeout))
    }

    /// Issue with the caller's overlapped record attached. A pending
    /// issue hands the context to the bridge and reports `Pending`; an
    /// inline completion still flows through the bridge so callbacks
    /// and the record behave identically on both paths.
    fn overlapped_op<F>(
        &self,
        record: &OverlappedResult,
        callback: Option<CompletionCallback>,
        pins: PinSet,
        issue: F,
    ) -> SockResult<usize>
    where
        F: FnOnce(&Arc<OpContext>) -> Issue,
    {
        let ctx = self.contexts.acquire(
            Waiter::Overlapped { shared: record.shared(), callback: Mutex::new(callback) },
            pins,
        )?;
        match issue(&ctx) {
            Issue::Pending => Err(SockError::Pending),
            Issue::Complete { status, bytes } => {
                finish_inline(&ctx, status, bytes);
                status?;
                Ok(bytes)
            }
        }
    }
}

/// No transfer flags are defined; non-zero is a caller error.
fn check_flags(flags: TransferFlags) -> SockResult<()> {
    if flags != 0 {
        return Err(SockError::InvalidArgument);
    }
    Ok(())
}

/// A completion callback only makes sense on the overlapped path.
fn reject_bare_callback(callback: Option<CompletionCallback>) -> SockResult<()> {
    if callback.is_some() {
        return Err(SockError::InvalidArgument);
    }
    Ok(())
}

fn decode_timeout(value: &[u8]) -> SockResult<TimeoutMs> {
    let raw: [u8; 4] = value.try_into().map_err(|_| SockError::InvalidArgument)?;
    Ok(TimeoutMs::from_ne_bytes(raw))
}
