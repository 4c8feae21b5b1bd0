//! The asynchronous operation bridge.
//!
//! Reconciles three execution models on one completion-driven engine
//! primitive:
//! - [`pin`]: owned, address-stable buffer descriptors per operation
//! - [`context`]: the per-call record, bounded pool, and cancel token
//! - [`completion`]: the single routine every finished operation funnels
//!   through
//! - [`wait`]: blocking waits with timeout and cooperative cancellation

pub mod completion;
pub mod context;
pub mod pin;
pub mod wait;
