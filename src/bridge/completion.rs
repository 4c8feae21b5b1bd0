//! The completion bridge.
//!
//! Single demultiplexing routine the engine invokes when any operation
//! finishes, on whatever thread the engine happens to be running. It
//! decides between the blocking-wait path (signal the internal event,
//! leave teardown to the waiting caller) and the overlapped path
//! (publish into the caller's record, run the callback behind a fault
//! barrier, signal, retire). It is the only place an overlapped context
//! is retired, which is what makes retire-at-most-once a local
//! argument instead of a whole-program one.

use crate::bridge::context::{OpContext, OpOutcome, OpPayload, Waiter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Deliver the true completion of one operation.
///
/// Safe to race with cancellation: whichever status the engine settled
/// on is the one published. A duplicate invocation is dropped.
pub fn complete(ctx: &Arc<OpContext>, status: crate::base::SockResult<()>, bytes: usize, payload: OpPayload) {
    let outcome = OpOutcome { status, bytes };
    if !ctx.record_completion(outcome, payload) {
        tracing::warn!("duplicate completion dropped");
        return;
    }

    match ctx.waiter() {
        Waiter::Blocking(event) => {
            // The blocking caller is parked on this event and owns the
            // context until it wakes; it reads the outcome and retires.
            event.signal();
        }
        Waiter::Overlapped { shared, callback } => {
            let (outcome, payload) = ctx.take_outcome();
            *shared.outcome.lock().unwrap() = Some(outcome);
            *shared.payload.lock().unwrap() = payload;

            if let Some(cb) = callback.lock().unwrap().take() {
                // Fault barrier: a misbehaving user callback must not
                // take the bridge down or leak the context.
                let result = catch_unwind(AssertUnwindSafe(move || {
                    cb(outcome.status, outcome.bytes)
                }));
                if result.is_err() {
                    tracing::warn!(bytes = outcome.bytes, "completion callback panicked; fault contained");
                }
            }

            // The callback always runs before external waiters can
            // observe completion.
            shared.done.store(true, Ordering::SeqCst);
            shared.event.signal();
            ctx.retire();
        }
    }
}

/// Route an inline (non-pending) completion through the same surface.
///
/// Engines answer some calls without suspending; those still publish to
/// overlapped waiters and run callbacks exactly like a late completion
/// would, so callers observe a single model.
pub fn finish_inline(ctx: &Arc<OpContext>, status: crate::base::SockResult<()>, bytes: usize) {
    complete(ctx, status, bytes, OpPayload::None);
}
