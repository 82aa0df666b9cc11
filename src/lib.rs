//! Pandora Core - control plane for a distributed IDS/IPS
//!
//! Agents on protected endpoints enroll, stream security events and receive
//! configuration. The control plane authenticates them, puts their events
//! on a durable topic bus, tiers the events through hot, cold and archive
//! storage, and answers threats with automated response actions. The
//! implementation prioritizes:
//!
//! 1. **Security** - mTLS or API-key authentication, PII redaction at ingest
//! 2. **Logging** - Every decision point logged with full context
//! 3. **Resilience** - Retries, circuit breakers and bounded shutdown
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `broker` - Topic-exchange adapter with reconnect and dead-lettering
//! - `credentials` - Agent PKI and API keys
//! - `registry` - Agent lifecycle, configs and heartbeat supervision
//! - `ingest` - Authenticated event submission with backpressure
//! - `storage` - Hot streams, the cold SQL tier and the archive
//! - `tiering` - Periodic promotion, integrity and retention jobs
//! - `rules` - Rule model and selection
//! - `response` - Action execution against effectors
//! - `compliance` - PII detection, anonymisation, GDPR and the audit trail
//! - `runtime` - Start-up and shutdown of the whole control plane
//! - `logging` - Structured logging with correlation context

pub mod broker;
pub mod clock;
pub mod compliance;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod extraction;
pub mod hashing;
pub mod ingest;
pub mod logging;
pub mod registry;
pub mod resilience;
pub mod response;
pub mod rules;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod tiering;

pub use error::{Error, Result};
pub use runtime::{Collaborators, ControlPlane};

/// Initialize the process logger. `RUST_LOG` overrides the `info` default;
/// calling this more than once is harmless.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
