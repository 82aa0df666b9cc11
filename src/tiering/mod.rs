//! Storage tiering.
//!
//! Four periodic tasks move events between tiers and police the cold tier:
//! `hot_to_cold`, `cold_to_archive`, `integrity_check` and `retention_sweep`.

pub mod pipeline;

pub use pipeline::*;
