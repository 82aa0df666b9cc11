//! Agent credentials.
//!
//! - `ca` - internal CA, leaf issuance and client chain verification
//! - `store` - per-agent credential lifecycle (issue, verify, rotate, revoke)

pub mod ca;
pub mod store;

pub use ca::*;
pub use store::*;
