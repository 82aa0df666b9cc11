//! Response rules.
//!
//! A rule filters threat events by type and severity, adds field
//! conditions over the event view and lists the actions to run. The engine
//! selects one rule per event, highest priority first.

pub mod engine;
pub mod model;

pub use engine::*;
pub use model::*;
