//! Field extraction.
//!
//! Dot-path resolution over raw agent documents and event views.

pub mod json_path;

pub use json_path::*;
