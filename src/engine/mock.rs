//! Scriptable engine for bridge and facade tests.
//!
//! Completes operations on plain worker threads after a configurable
//! artificial delay, which lets tests hold an operation "in the
//! provider" for as long as they need: long enough to prove the
//! registry lock is not held across I/O, or longer than a blocking
//! timeout to force the cancel-then-rewait path.

use crate::base::{AddressFamily, SockError, SockResult};
use crate::bridge::completion::complete;
use crate::bridge::context::{OpContext, OpPayload};
use crate::engine::{make_version, Engine, Issue, ProviderInfo, ProviderSocket};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn mock_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[derive(Debug, Clone, Copy)]
struct MockConfig {
    delay: Duration,
}

#[derive(Debug)]
pub struct MockSock {
    config: MockConfig,
    /// Next payload a receive will deliver; a receive with no payload
    /// queued blocks until cancelled, like an idle connection.
    recv_data: Mutex<Vec<Bytes>>,
    local: Mutex<Option<SocketAddr>>,
}

impl MockSock {
    fn new(config: MockConfig) -> Arc<Self> {
        Arc::new(Self { config, recv_data: Mutex::new(Vec::new()), local: Mutex::new(None) })
    }

    /// Queue a payload for the next receive.
    pub fn push_recv(&self, data: Bytes) {
        self.recv_data.lock().unwrap().push(data);
    }

    fn finish_after(
        &self,
        ctx: &Arc<OpContext>,
        outcome: (SockResult<()>, usize, OpPayload),
    ) -> Issue {
        let ctx = Arc::clone(ctx);
        let delay = self.config.delay;
        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + delay;
            loop {
                if ctx.cancel().is_requested() {
                    complete(&ctx, Err(SockError::Cancelled), 0, OpPayload::None);
                    return;
                }
                if std::time::Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            let (status, bytes, payload) = outcome;
            complete(&ctx, status, bytes, payload);
        });
        Issue::Pending
    }

    /// Hold the operation open until cancellation arrives.
    fn block_until_cancel(&self, ctx: &Arc<OpContext>) -> Issue {
        let ctx = Arc::clone(ctx);
        std::thread::spawn(move || {
            while !ctx.cancel().is_requested() {
                std::thread::sleep(Duration::from_millis(1));
            }
            complete(&ctx, Err(SockError::Cancelled), 0, OpPayload::None);
        });
        Issue::Pending
    }
}

impl ProviderSocket for MockSock {
    fn issue_bind(&self, addr: SocketAddr, _ctx: &Arc<OpContext>) -> Issue {
        *self.local.lock().unwrap() = Some(addr);
        Issue::ok(0)
    }

    fn issue_listen(&self, _backlog: u32, _ctx: &Arc<OpContext>) -> Issue {
        Issue::ok(0)
    }

    fn issue_connect(&self, _addr: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        self.finish_after(ctx, (Ok(()), 0, OpPayload::None))
    }

    fn issue_accept(&self, ctx: &Arc<OpContext>) -> Issue {
        let accepted: Arc<dyn ProviderSocket> = MockSock::new(self.config);
        self.finish_after(ctx, (Ok(()), 0, OpPayload::Accepted(accepted, mock_addr(9))))
    }

    fn issue_send(&self, data: Bytes, ctx: &Arc<OpContext>) -> Issue {
        self.finish_after(ctx, (Ok(()), data.len(), OpPayload::None))
    }

    fn issue_recv(&self, mut buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let queued = self.recv_data.lock().unwrap().pop();
        match queued {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                buf.truncate(n);
                self.finish_after(ctx, (Ok(()), n, OpPayload::Data(buf.freeze())))
            }
            None => self.block_until_cancel(ctx),
        }
    }

    fn issue_send_to(&self, data: Bytes, _peer: SocketAddr, ctx: &Arc<OpContext>) -> Issue {
        self.finish_after(ctx, (Ok(()), data.len(), OpPayload::None))
    }

    fn issue_recv_from(&self, mut buf: BytesMut, ctx: &Arc<OpContext>) -> Issue {
        let queued = self.recv_data.lock().unwrap().pop();
        match queued {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                buf.truncate(n);
                self.finish_after(
                    ctx,
                    (Ok(()), n, OpPayload::Datagram(buf.freeze(), mock_addr(9))),
                )
            }
            None => self.block_until_cancel(ctx),
        }
    }

    fn issue_disconnect(&self, ctx: &Arc<OpContext>) -> Issue {
        self.finish_after(ctx, (Ok(()), 0, OpPayload::None))
    }

    fn local_addr(&self) -> SockResult<SocketAddr> {
        self.local.lock().unwrap().ok_or(SockError::NotConnected)
    }

    fn close(&self) {}
}

/// Engine whose sockets are [`MockSock`]s.
#[derive(Debug)]
pub struct MockEngine {
    config: MockConfig,
    unified: bool,
    created: Mutex<Vec<Arc<MockSock>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(0))
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { config: MockConfig { delay }, unified: true, created: Mutex::new(Vec::new()) }
    }

    pub fn legacy() -> Self {
        Self::legacy_with_delay(Duration::from_millis(0))
    }

    pub fn legacy_with_delay(delay: Duration) -> Self {
        Self { config: MockConfig { delay }, unified: false, created: Mutex::new(Vec::new()) }
    }

    fn track(&self, sock: Arc<MockSock>) -> Arc<dyn ProviderSocket> {
        self.created.lock().unwrap().push(Arc::clone(&sock));
        sock
    }

    /// Most recently created socket, for scripting its next receive.
    pub fn last_created(&self) -> Arc<MockSock> {
        Arc::clone(self.created.lock().unwrap().last().expect("no sockets created"))
    }
}

impl Engine for MockEngine {
    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            highest_version: make_version(1, if self.unified { 1 } else { 0 }),
            lowest_version: make_version(1, 0),
        }
    }

    fn supports_unified_stream(&self) -> bool {
        self.unified
    }

    fn stream_socket(&self, _family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>> {
        if !self.unified {
            return Err(SockError::UnsupportedForClass);
        }
        Ok(self.track(MockSock::new(self.config)))
    }

    fn listen_socket(&self, _family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>> {
        Ok(self.track(MockSock::new(self.config)))
    }

    fn connection_socket(&self, _family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>> {
        Ok(self.track(MockSock::new(self.config)))
    }

    fn datagram_socket(&self, _family: AddressFamily) -> SockResult<Arc<dyn ProviderSocket>> {
        Ok(self.track(MockSock::new(self.config)))
    }
}
