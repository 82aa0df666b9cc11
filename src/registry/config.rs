//! Effective agent configuration and per-mode defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::AgentMode;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Mtls,
    ApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMethod {
    Streaming,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Exponential,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    DropOldest,
    DropNewest,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPolicy {
    pub method: UploadMethod,
    pub batch_size: u32,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BufferPolicy {
    Persistent { path: String, max_bytes: u64 },
    Memory { max_bytes: u64 },
}

impl BufferPolicy {
    pub fn max_bytes(&self) -> u64 {
        match self {
            BufferPolicy::Persistent { max_bytes, .. } | BufferPolicy::Memory { max_bytes } => {
                *max_bytes
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub mode: AgentMode,
    pub endpoint: String,
    pub auth_method: AuthMethod,
    pub upload: UploadPolicy,
    pub retry: RetryPolicy,
    pub compression: bool,
    pub buffer: BufferPolicy,
    pub overflow_strategy: OverflowStrategy,
    pub encrypt_in_transit: bool,
    pub encrypt_at_rest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_rotation_hours: Option<u32>,
    pub capabilities: Vec<String>,
}

impl AgentConfig {
    /// Defaults for agents outside the perimeter: mTLS through the edge
    /// proxy, durable buffering, aggressive retry.
    pub fn external(endpoint: &str) -> Self {
        Self {
            mode: AgentMode::External,
            endpoint: endpoint.to_string(),
            auth_method: AuthMethod::Mtls,
            upload: UploadPolicy {
                method: UploadMethod::Streaming,
                batch_size: 100,
                flush_interval_secs: 10,
            },
            retry: RetryPolicy {
                max_attempts: 5,
                backoff: Backoff::Exponential,
            },
            compression: true,
            buffer: BufferPolicy::Persistent {
                path: "/var/lib/pandora-agent/buffer".to_string(),
                max_bytes: GIB,
            },
            overflow_strategy: OverflowStrategy::DropOldest,
            encrypt_in_transit: true,
            encrypt_at_rest: true,
            key_rotation_hours: Some(24),
            capabilities: vec![
                "windows_logs".to_string(),
                "metrics".to_string(),
                "compliance_scan".to_string(),
            ],
        }
    }

    /// Defaults for agents on the internal network: direct API-key access,
    /// in-memory buffer, block on overflow.
    pub fn internal(endpoint: &str) -> Self {
        Self {
            mode: AgentMode::Internal,
            endpoint: endpoint.to_string(),
            auth_method: AuthMethod::ApiKey,
            upload: UploadPolicy {
                method: UploadMethod::Streaming,
                batch_size: 500,
                flush_interval_secs: 5,
            },
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Linear,
            },
            compression: false,
            buffer: BufferPolicy::Memory {
                max_bytes: 256 * MIB,
            },
            overflow_strategy: OverflowStrategy::Block,
            encrypt_in_transit: false,
            encrypt_at_rest: false,
            key_rotation_hours: None,
            capabilities: vec!["windows_logs".to_string(), "metrics".to_string()],
        }
    }

    pub fn for_mode(mode: AgentMode, endpoint: &str) -> Self {
        match mode {
            AgentMode::External => Self::external(endpoint),
            AgentMode::Internal => Self::internal(endpoint),
        }
    }

    /// In-flight event cap the gateway enforces for this agent.
    pub fn in_flight_cap(&self, assumed_event_bytes: u64, min: usize, max: usize) -> usize {
        let per_event = assumed_event_bytes.max(1);
        let derived = (self.buffer.max_bytes() / per_event) as usize;
        derived.clamp(min, max.max(min))
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload.batch_size == 0 {
            return Err(Error::InvalidArgument("upload.batch_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidArgument("retry.max_attempts must be positive".into()));
        }
        if self.buffer.max_bytes() == 0 {
            return Err(Error::InvalidArgument("buffer max_bytes must be positive".into()));
        }
        let expected = match self.mode {
            AgentMode::External => AuthMethod::Mtls,
            AgentMode::Internal => AuthMethod::ApiKey,
        };
        if self.auth_method != expected {
            return Err(Error::InvalidArgument(format!(
                "{} agents authenticate with {:?}",
                self.mode, expected
            )));
        }
        Ok(())
    }
}
