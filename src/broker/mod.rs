//! Event bus.
//!
//! - `topic` - AMQP topic pattern matching
//! - `message` - outbound messages, deliveries, confirms and health
//! - `transport` - the connection seam a concrete broker implements
//! - `memory` - in-process durable broker
//! - `adapter` - reconnecting publish/subscribe adapter

pub mod adapter;
pub mod memory;
pub mod message;
pub mod topic;
pub mod transport;

pub use adapter::*;
pub use memory::*;
pub use message::*;
pub use topic::*;
pub use transport::*;
