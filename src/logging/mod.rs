//! Structured logging with correlation context.
//!
//! Every log line starts with the bracketed context of the agent, event,
//! task or request it concerns, followed by an upper-snake event token.

pub mod structured;

pub use structured::*;
