//! Tiered event storage.
//!
//! - `models` - stored rows, retention policies and stream entries
//! - `queries` - DDL and DML builders for PostgreSQL and SQLite
//! - `hot` - bounded per-agent streams with consumer groups
//! - `cold` - the `event_logs` table with integrity hashes
//! - `archive` - immutable archive objects

pub mod archive;
pub mod cold;
pub mod hot;
pub mod models;
pub mod queries;
#[cfg(feature = "redis")]
pub mod redis_hot;

pub use archive::*;
pub use cold::*;
pub use hot::*;
pub use models::*;
pub use queries::*;
#[cfg(feature = "redis")]
pub use redis_hot::*;
