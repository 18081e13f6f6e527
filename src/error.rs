//! Error types for the bridge.
//!
//! [`BridgeError`] is what every host-facing operation returns. Failures that
//! originate inside the script are carried as a [`FatalError`] built by the
//! result translator; everything else (dead workers, timeouts, broken
//! envelopes) is raised on the host side.

use crate::engine::instance::WorkerState;
use crate::protocol::{CorrelationId, WorkerId};
use crate::translate::{EngineError, ErrorCategory, FatalError};
use serde::{Deserialize, Serialize};

/// Error codes for categorizing errors in logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The library rejected its input (bad SDL, invalid operation)
    Validation,
    /// The library failed unexpectedly
    Engine,
    /// Unknown request kind, unknown session or an undecodable envelope
    Protocol,
    /// A worker failed to start
    Initialization,
    /// A worker terminated while requests were in flight
    WorkerDied,
    /// A request was sent to a worker that is no longer running
    NotRunning,
    /// No response arrived within the request timeout
    Timeout,
    /// A correlation id that is not awaiting a reply
    UnknownCorrelationId,
    /// A request could not be serialized
    Serialization,
    /// A response could not be deserialized
    Deserialization,
    /// No worker in the pool can take another session
    PoolExhausted,
    /// Invalid configuration
    Config,
    /// Filesystem error
    Io,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Validation => write!(f, "VALIDATION"),
            ErrorCode::Engine => write!(f, "ENGINE"),
            ErrorCode::Protocol => write!(f, "PROTOCOL"),
            ErrorCode::Initialization => write!(f, "INITIALIZATION"),
            ErrorCode::WorkerDied => write!(f, "WORKER_DIED"),
            ErrorCode::NotRunning => write!(f, "NOT_RUNNING"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::UnknownCorrelationId => write!(f, "UNKNOWN_CORRELATION_ID"),
            ErrorCode::Serialization => write!(f, "SERIALIZATION"),
            ErrorCode::Deserialization => write!(f, "DESERIALIZATION"),
            ErrorCode::PoolExhausted => write!(f, "POOL_EXHAUSTED"),
            ErrorCode::Config => write!(f, "CONFIG"),
            ErrorCode::Io => write!(f, "IO"),
        }
    }
}

/// Main error type for the bridge
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The worker could not be created or its payload failed to evaluate
    #[error("worker initialization failed: {message}")]
    Initialization {
        /// What went wrong
        message: String,
        /// Translated script exceptions, if the payload threw
        errors: Vec<EngineError>,
    },

    /// The worker terminated, or the script reported a failure it could not
    /// attribute to a single request
    #[error("worker {worker_id} died: {reason}")]
    WorkerDied {
        /// Worker that died
        worker_id: WorkerId,
        /// Why it died
        reason: String,
        /// Translated script errors for unattributed failures
        errors: Vec<EngineError>,
    },

    /// The worker refuses new requests
    #[error("worker {worker_id} is not running (state: {state})")]
    NotRunning {
        /// Worker that refused the request
        worker_id: WorkerId,
        /// State it was in
        state: WorkerState,
    },

    /// No response within the request timeout
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Id of the abandoned request
        correlation_id: CorrelationId,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The correlation id is not awaiting a reply
    #[error("unknown correlation id `{0}`")]
    UnknownCorrelationId(CorrelationId),

    /// Envelope or routing error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A request could not be serialized before being sent to the worker
    #[error("couldn't serialize `{name}`: `{message}`")]
    Serialization {
        /// Name of the value being serialized
        name: String,
        /// The underlying serde error
        message: String,
    },

    /// A response payload could not be deserialized
    #[error("couldn't deserialize response `{id}`: `{message}`")]
    Deserialization {
        /// Correlation id of the response
        id: CorrelationId,
        /// The underlying serde error
        message: String,
    },

    /// The script answered with errors
    #[error("{0}")]
    Script(FatalError),

    /// No pool worker can accept the session
    #[error("worker pool exhausted: {0}")]
    PoolExhausted(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl BridgeError {
    /// Classify this error for metrics
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Initialization { .. } => ErrorCode::Initialization,
            BridgeError::WorkerDied { .. } => ErrorCode::WorkerDied,
            BridgeError::NotRunning { .. } => ErrorCode::NotRunning,
            BridgeError::Timeout { .. } => ErrorCode::Timeout,
            BridgeError::UnknownCorrelationId(_) => ErrorCode::UnknownCorrelationId,
            BridgeError::Protocol(_) => ErrorCode::Protocol,
            BridgeError::Serialization { .. } => ErrorCode::Serialization,
            BridgeError::Deserialization { .. } => ErrorCode::Deserialization,
            BridgeError::Script(fatal) => match fatal.category() {
                ErrorCategory::Validation => ErrorCode::Validation,
                ErrorCategory::Engine => ErrorCode::Engine,
                ErrorCategory::Protocol => ErrorCode::Protocol,
                ErrorCategory::FatalWorker => ErrorCode::WorkerDied,
            },
            BridgeError::PoolExhausted(_) => ErrorCode::PoolExhausted,
            BridgeError::Config(_) => ErrorCode::Config,
            BridgeError::Io(_) => ErrorCode::Io,
        }
    }

    /// Which part of the taxonomy this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::Script(fatal) => fatal.category(),
            BridgeError::Initialization { .. }
            | BridgeError::WorkerDied { .. }
            | BridgeError::NotRunning { .. } => ErrorCategory::FatalWorker,
            _ => ErrorCategory::Protocol,
        }
    }

    /// Whether the error was caused by the caller's input
    pub fn is_validation(&self) -> bool {
        matches!(self, BridgeError::Script(fatal) if fatal.is_validation())
    }

    /// Text that is safe to show to whoever sent the schema or operation.
    ///
    /// Validation errors are rendered verbatim since they describe the
    /// caller's input. Anything else becomes a generic message that only
    /// carries the correlation id for cross-referencing the logs.
    pub fn user_message(&self) -> String {
        match self {
            BridgeError::Script(fatal) if fatal.is_validation() => fatal.to_string(),
            BridgeError::Script(FatalError { id: Some(id), .. })
            | BridgeError::Timeout {
                correlation_id: id, ..
            }
            | BridgeError::Deserialization { id, .. } => {
                format!("an internal error occurred while processing request {id}")
            }
            _ => "an internal error occurred".to_string(),
        }
    }

    /// Errors translated from the script, if any
    pub fn engine_errors(&self) -> &[EngineError] {
        match self {
            BridgeError::Script(fatal) => &fatal.errors,
            BridgeError::Initialization { errors, .. } | BridgeError::WorkerDied { errors, .. } => {
                errors
            }
            _ => &[],
        }
    }
}

impl From<crate::config::ConfigError> for BridgeError {
    fn from(e: crate::config::ConfigError) -> Self {
        BridgeError::Config(e.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e.to_string())
    }
}

impl From<FatalError> for BridgeError {
    fn from(fatal: FatalError) -> Self {
        BridgeError::Script(fatal)
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
