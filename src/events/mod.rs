//! Event model.
//!
//! - `envelope` - the immutable envelope and its typed family payloads
//! - `routing` - routing keys, families, queues and the exchange topology

pub mod envelope;
pub mod routing;

pub use envelope::*;
pub use routing::*;
