//! Resilience fabric.
//!
//! Primitives shared by every component that calls out of process:
//! - Cancellation tokens owned by the caller
//! - Bounded retry with exponential backoff and jitter
//! - Circuit breakers, individually and keyed by effector target

pub mod breaker;
pub mod cancel;
pub mod retry;

pub use breaker::*;
pub use cancel::*;
pub use retry::*;
