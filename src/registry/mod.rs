//! Agent registry.
//!
//! - `agent` - agent records, registration and heartbeat shapes
//! - `config` - effective per-agent configuration and mode defaults
//! - `fleet` - the registry itself
//! - `supervisor` - periodic offline detection

pub mod agent;
pub mod config;
pub mod fleet;
pub mod supervisor;

pub use agent::*;
pub use config::*;
pub use fleet::*;
pub use supervisor::*;
