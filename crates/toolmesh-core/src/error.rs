//! Error types for toolmesh operations

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC "invalid request" code
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC "method not found" code
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC "invalid params" code
pub const INVALID_PARAMS: i64 = -32602;

/// Errors that can occur while orchestrating calls across tool servers
#[derive(Error, Debug)]
pub enum MeshError {
    /// A server with this id is already registered
    #[error("Server already registered: {0}")]
    DuplicateServer(String),

    /// No server with this id is registered
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// The minimum set of connections for a pool could not be established
    #[error("Failed to create pool for {server_id} after {attempts} attempt(s): {reason}")]
    PoolCreation {
        server_id: String,
        attempts: u32,
        reason: String,
    },

    /// Every connection is leased and the wait timeout elapsed
    #[error("Connection pool for {server_id} exhausted after waiting {waited:?}")]
    PoolExhausted { server_id: String, waited: Duration },

    /// The pool was closed, or never created
    #[error("Connection pool for {0} is closed")]
    PoolClosed(String),

    /// No registered, healthy, circuit-closed server offers the capability
    #[error("No available server for capability '{capability}': {reason}")]
    NoAvailableServer { capability: String, reason: String },

    /// An attempt did not complete within its timeout
    #[error("Request to {server_id} timed out after {timeout:?}")]
    RequestTimeout { server_id: String, timeout: Duration },

    /// Connection-level failure (spawn, I/O, HTTP, closed pipe)
    #[error("Transport error ({server_id}): {message}")]
    Transport { server_id: String, message: String },

    /// The server answered with a JSON-RPC error object
    #[error("Server error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// Every attempt of a routed call failed
    #[error(
        "Capability '{capability}' failed after {} attempt(s): {}",
        .attempts.len(),
        AttemptList(.attempts)
    )]
    RequestFailed {
        capability: String,
        attempts: Vec<AttemptFailure>,
    },

    /// Every server of a fanout call failed
    #[error(
        "Fanout of '{capability}' failed on all {} server(s): {}",
        .failures.len(),
        AttemptList(.failures)
    )]
    Aggregation {
        capability: String,
        failures: Vec<AttemptFailure>,
    },

    /// The caller cancelled the operation or its deadline passed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The client has been shut down
    #[error("Client has been shut down")]
    ShutDown,

    /// Arguments were not a JSON object
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Environment variable error
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// Invalid pattern error
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Transport,
    Protocol,
    PoolExhausted,
    Other,
}

/// One failed attempt against one server
#[derive(Debug)]
pub struct AttemptFailure {
    pub server_id: String,
    pub latency: Duration,
    pub error: MeshError,
}

impl AttemptFailure {
    pub fn new(server_id: impl Into<String>, latency: Duration, error: MeshError) -> Self {
        Self {
            server_id: server_id.into(),
            latency,
            error,
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

struct AttemptList<'a>(&'a [AttemptFailure]);

impl fmt::Display for AttemptList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, attempt) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{}] {}", attempt.server_id, attempt.error)?;
        }
        Ok(())
    }
}

impl MeshError {
    pub(crate) fn transport(server_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transport {
            server_id: server_id.into(),
            message: message.to_string(),
        }
    }

    /// Classify the error for retry and circuit-breaker bookkeeping
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RequestTimeout { .. } => FailureKind::Timeout,
            Self::Transport { .. } | Self::PoolCreation { .. } | Self::Io(_) => {
                FailureKind::Transport
            }
            Self::Protocol { .. } | Self::Json(_) => FailureKind::Protocol,
            Self::PoolExhausted { .. } => FailureKind::PoolExhausted,
            _ => FailureKind::Other,
        }
    }

    /// Whether another attempt (possibly on another server) may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestTimeout { .. }
            | Self::Transport { .. }
            | Self::PoolExhausted { .. }
            | Self::PoolCreation { .. }
            | Self::PoolClosed(_)
            | Self::Io(_) => true,
            Self::Protocol { code, .. } => *code != INVALID_REQUEST && *code != INVALID_PARAMS,
            _ => false,
        }
    }

    /// Whether the failure should count against the server's circuit
    pub fn counts_as_server_failure(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::PoolClosed(_) | Self::Cancelled(_) => false,
            Self::Protocol { code, .. } => *code != INVALID_REQUEST && *code != INVALID_PARAMS,
            other => other.is_retryable(),
        }
    }

    /// True when the last attempt (or the error itself) was a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::RequestTimeout { .. } => true,
            Self::RequestFailed { attempts, .. } => attempts
                .last()
                .is_some_and(|a| a.kind() == FailureKind::Timeout),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MeshError::transport("a", "broken pipe").is_retryable());
        assert!(
            MeshError::RequestTimeout {
                server_id: "a".into(),
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(
            MeshError::Protocol {
                code: -32000,
                message: "boom".into()
            }
            .is_retryable()
        );
        assert!(
            !MeshError::Protocol {
                code: INVALID_PARAMS,
                message: "bad".into()
            }
            .is_retryable()
        );
        assert!(!MeshError::DuplicateServer("a".into()).is_retryable());
        assert!(!MeshError::Config("x".into()).is_retryable());
    }

    #[test]
    fn test_pool_exhausted_does_not_trip_circuit() {
        let err = MeshError::PoolExhausted {
            server_id: "a".into(),
            waited: Duration::from_millis(10),
        };
        assert!(err.is_retryable());
        assert!(!err.counts_as_server_failure());
    }

    #[test]
    fn test_request_failed_display_lists_attempts() {
        let err = MeshError::RequestFailed {
            capability: "search".into(),
            attempts: vec![
                AttemptFailure::new(
                    "a",
                    Duration::from_millis(5),
                    MeshError::transport("a", "reset"),
                ),
                AttemptFailure::new(
                    "b",
                    Duration::from_millis(30),
                    MeshError::RequestTimeout {
                        server_id: "b".into(),
                        timeout: Duration::from_millis(30),
                    },
                ),
            ],
        };

        let text = err.to_string();
        assert!(text.contains("2 attempt(s)"));
        assert!(text.contains("[a]"));
        assert!(text.contains("[b]"));
        assert!(err.is_timeout());
    }
}
