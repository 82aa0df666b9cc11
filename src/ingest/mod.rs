//! Ingest gateway.
//!
//! Authenticated intake of agent events:
//! - `context` - per-request correlation
//! - `validation` - schema and timestamp checks
//! - `backpressure` - per-agent in-flight cap
//! - `gateway` - the batch and streaming entry points

pub mod backpressure;
pub mod context;
pub mod gateway;
pub mod validation;

pub use backpressure::*;
pub use context::*;
pub use gateway::*;
pub use validation::*;
