//! Timeout and cancellation control for blocking calls.
//!
//! Cancellation in the engine is cooperative: asking for it does not
//! complete the operation, it only hurries it along. After a timeout we
//! therefore wait a second time, unconditionally, for the operation's
//! true completion. Returning earlier would hand the caller back a
//! buffer the engine may still be writing into.

use crate::base::{SockError, SockResult, TimeoutMs, INFINITE_WAIT};
use crate::bridge::context::{OpContext, OpPayload};
use crate::engine::Issue;
use std::sync::Arc;
use std::time::Duration;

/// Result of one blocking operation: status, best-effort byte count
/// (meaningful even on timeout), and the opaque payload slot.
pub struct BlockingOutcome {
    pub status: SockResult<()>,
    pub bytes: usize,
    pub payload: OpPayload,
}

/// Drive a just-issued blocking operation to its end and tear the
/// context down exactly once.
pub fn wait_blocking(ctx: Arc<OpContext>, issue: Issue, timeout: TimeoutMs) -> BlockingOutcome {
    match issue {
        Issue::Complete { status, bytes } => {
            // Inline completion: same teardown path, no suspension.
            ctx.retire();
            BlockingOutcome { status, bytes, payload: OpPayload::None }
        }
        Issue::Pending => {
            let event = ctx.event().expect("blocking context has an internal event");

            let timed_out = if timeout == INFINITE_WAIT {
                event.wait();
                false
            } else if event.wait_timeout(Duration::from_millis(u64::from(timeout))) {
                false
            } else {
                tracing::debug!(timeout_ms = timeout, "blocking wait expired; requesting cancel");
                ctx.cancel().request();
                // The engine may still finish the operation, successfully
                // or not, concurrently with the cancel request. Wait for
                // the true completion before touching the context.
                event.wait();
                true
            };

            let (outcome, payload) = ctx.take_outcome();
            ctx.retire();

            if timed_out {
                // Caller-visible result is Timeout regardless of what the
                // delayed completion reported; the byte count stays.
                BlockingOutcome { status: Err(SockError::Timeout), bytes: outcome.bytes, payload }
            } else {
                BlockingOutcome { status: outcome.status, bytes: outcome.bytes, payload }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::completion::complete;
    use crate::bridge::context::{CompletionEvent, ContextPool, PinSet, Waiter};
    use std::thread;
    use std::time::Instant;

    fn blocking_ctx(pool: &Arc<ContextPool>) -> Arc<OpContext> {
        pool.acquire(Waiter::Blocking(CompletionEvent::new()), PinSet::default()).unwrap()
    }

    #[test]
    fn test_inline_completion_same_teardown() {
        let pool = ContextPool::new(4);
        let ctx = blocking_ctx(&pool);
        let out = wait_blocking(ctx, Issue::Complete { status: Ok(()), bytes: 3 }, INFINITE_WAIT);
        assert_eq!(out.status, Ok(()));
        assert_eq!(out.bytes, 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_pending_then_completed() {
        let pool = ContextPool::new(4);
        let ctx = blocking_ctx(&pool);

        let engine_side = Arc::clone(&ctx);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            complete(&engine_side, Ok(()), 11, OpPayload::None);
        });

        let out = wait_blocking(ctx, Issue::Pending, INFINITE_WAIT);
        worker.join().unwrap();
        assert_eq!(out.status, Ok(()));
        assert_eq!(out.bytes, 11);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_timeout_waits_for_true_completion() {
        let pool = ContextPool::new(4);
        let ctx = blocking_ctx(&pool);

        // Engine side: ignores progress until cancel is requested, then
        // takes a further moment to actually complete.
        let engine_side = Arc::clone(&ctx);
        let worker = thread::spawn(move || {
            while !engine_side.cancel().is_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(30));
            complete(&engine_side, Err(SockError::Cancelled), 2, OpPayload::None);
        });

        let start = Instant::now();
        let out = wait_blocking(ctx, Issue::Pending, 10);
        worker.join().unwrap();

        assert_eq!(out.status, Err(SockError::Timeout));
        // Best-effort byte count from the delayed completion survives.
        assert_eq!(out.bytes, 2);
        // We waited past the timeout for the true completion.
        assert!(start.elapsed() >= Duration::from_millis(35));
        assert_eq!(pool.in_flight(), 0);
    }
}
