//! Error kinds surfaced by the control plane.
//!
//! Every component returns [`Error`]. The gateway turns it into a normalised
//! status code for agents via [`Error::status_code`].

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("credential expired: {0}")]
    Expired(String),

    #[error("credential revoked: {0}")]
    Revoked(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        message: String,
        retry_after: Duration,
    },

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Permanent {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("circuit open: {0}")]
    OpenCircuit(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_)
                | Error::Timeout(_)
                | Error::OpenCircuit(_)
                | Error::ResourceExhausted { .. }
        )
    }

    /// Normalised HTTP-style status returned to agents.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Unauthenticated(_) | Error::Expired(_) | Error::Revoked(_) => 401,
            Error::Unauthorized(_) => 403,
            Error::InvalidArgument(_) | Error::InvalidAction(_) | Error::Serialization(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::FailedPrecondition(_) => 412,
            Error::ResourceExhausted { .. } => 429,
            Error::Cancelled => 499,
            Error::Permanent { .. } => 502,
            Error::Transient(_) | Error::OpenCircuit(_) => 503,
            Error::Timeout(_) => 504,
            Error::Integrity(_) | Error::Storage(_) | Error::Crypto(_) | Error::Config(_) => 500,
        }
    }

    /// Backpressure hint for rate-limited and retryable responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::ResourceExhausted { retry_after, .. } => Some(*retry_after),
            Error::Transient(_) | Error::OpenCircuit(_) | Error::Timeout(_) => {
                Some(Duration::from_secs(1))
            }
            _ => None,
        }
    }

    /// Short machine-readable kind, used in logs and response payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthenticated(_) => "unauthenticated",
            Error::Expired(_) => "expired",
            Error::Revoked(_) => "revoked",
            Error::Unauthorized(_) => "unauthorized",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::InvalidAction(_) => "invalid_action",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::ResourceExhausted { .. } => "resource_exhausted",
            Error::FailedPrecondition(_) => "failed_precondition",
            Error::Transient(_) => "transient",
            Error::Permanent { .. } => "permanent",
            Error::OpenCircuit(_) => "open_circuit",
            Error::Integrity(_) => "integrity",
            Error::Cancelled => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Crypto(_) => "crypto",
            Error::Config(_) => "config",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            Error::Transient(err.to_string())
        } else {
            Error::Storage(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::Transient("broker reconnecting".into()).is_retryable());
        assert!(Error::OpenCircuit("firewall".into()).is_retryable());
        assert!(!Error::InvalidArgument("bad".into()).is_retryable());
        assert!(!Error::Permanent {
            attempts: 3,
            last: Box::new(Error::Transient("x".into())),
        }
        .is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Unauthenticated("x".into()).status_code(), 401);
        assert_eq!(Error::Revoked("x".into()).status_code(), 401);
        assert_eq!(Error::Conflict("x".into()).status_code(), 409);
        let exhausted = Error::ResourceExhausted {
            message: "in-flight cap".into(),
            retry_after: Duration::from_secs(5),
        };
        assert_eq!(exhausted.status_code(), 429);
        assert_eq!(exhausted.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_permanent_wraps_last_error() {
        let err = Error::Permanent {
            attempts: 3,
            last: Box::new(Error::Transient("connection reset".into())),
        };
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(err.kind(), "permanent");
    }
}
