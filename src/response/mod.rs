//! Automated response.
//!
//! - `effectors` - adapter traits for firewalls, hosts, endpoints, notifications and tickets
//! - `firewall` - iptables and in-memory firewalls
//! - `recording` - call-recording effectors
//! - `executor` - runs actions under timeout, retry and per-target breakers

pub mod effectors;
pub mod executor;
pub mod firewall;
pub mod recording;

pub use effectors::*;
pub use executor::*;
pub use firewall::*;
pub use recording::*;
