//! Bridge configuration types and defaults.
//!
//! This module defines the knobs for worker supervision: engine limits,
//! pool sizing, timeouts and error truncation.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of workers in a pool
pub const DEFAULT_POOL_SIZE: usize = 1;

/// Default number of schema sessions a single worker may hold
pub const DEFAULT_MAX_SESSIONS_PER_WORKER: usize = 8;

/// Default heap limit per worker (256 MB)
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 256 * 1024 * 1024;

/// Default interpreter stack size per worker (1 MB)
pub const DEFAULT_MAX_STACK_SIZE_BYTES: u64 = 1024 * 1024;

/// Default time to wait for a response
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default time a worker gets to leave its loop after a global exit
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Default cap on `nodes`/`locations` entries kept per error or hint
pub const DEFAULT_NODES_LIMIT: usize = 20;

/// Default prefix for worker thread names
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "federation-bridge";

/// Prefix of the environment variables read by [`BridgeConfig::from_env`]
pub const ENV_PREFIX: &str = "FEDERATION_BRIDGE_";

/// Configuration for workers and pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Number of workers in a pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Sessions a single worker may hold before placement moves on
    #[serde(default = "default_max_sessions_per_worker")]
    pub max_sessions_per_worker: usize,

    /// Heap limit of each engine runtime in bytes (default: 256MB)
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,

    /// Interpreter stack limit in bytes (default: 1MB)
    #[serde(default = "default_max_stack_size")]
    pub max_stack_size_bytes: u64,

    /// How long `await_response` waits before giving up
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// How long `shutdown` waits before interrupting the engine
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Cap on nodes/locations kept per error or hint
    #[serde(default = "default_nodes_limit")]
    pub nodes_limit: usize,

    /// Prefix of worker thread names
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_sessions_per_worker: DEFAULT_MAX_SESSIONS_PER_WORKER,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            max_stack_size_bytes: DEFAULT_MAX_STACK_SIZE_BYTES,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            nodes_limit: DEFAULT_NODES_LIMIT,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `FEDERATION_BRIDGE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values looked up by variable name.
    ///
    /// Recognized: `MEMORY_LIMIT_BYTES`, `MAX_STACK_SIZE_BYTES`, `POOL_SIZE`,
    /// `MAX_SESSIONS_PER_WORKER`, `REQUEST_TIMEOUT_MS`, `SHUTDOWN_GRACE_MS`,
    /// `NODES_LIMIT`, all prefixed with [`ENV_PREFIX`].
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_field(&lookup, "MEMORY_LIMIT_BYTES", &mut self.memory_limit_bytes)?;
        override_field(&lookup, "MAX_STACK_SIZE_BYTES", &mut self.max_stack_size_bytes)?;
        override_field(&lookup, "POOL_SIZE", &mut self.pool_size)?;
        override_field(
            &lookup,
            "MAX_SESSIONS_PER_WORKER",
            &mut self.max_sessions_per_worker,
        )?;
        override_field(&lookup, "REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms)?;
        override_field(&lookup, "SHUTDOWN_GRACE_MS", &mut self.shutdown_grace_ms)?;
        override_field(&lookup, "NODES_LIMIT", &mut self.nodes_limit)?;
        self.validate()?;
        Ok(self)
    }

    /// Set the number of pool workers
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the session limit per worker
    pub fn with_max_sessions_per_worker(mut self, max: usize) -> Self {
        self.max_sessions_per_worker = max;
        self
    }

    /// Set the heap limit per worker
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set the interpreter stack limit
    pub fn with_max_stack_size(mut self, bytes: u64) -> Self {
        self.max_stack_size_bytes = bytes;
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    /// Set the nodes/locations cap
    pub fn with_nodes_limit(mut self, limit: usize) -> Self {
        self.nodes_limit = limit;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool_size".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.max_sessions_per_worker == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_sessions_per_worker".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.memory_limit_bytes < 1024 * 1024 {
            return Err(ConfigError::InvalidValue {
                field: "memory_limit_bytes".into(),
                reason: "must be at least 1MB".into(),
            });
        }

        if self.max_stack_size_bytes < 64 * 1024 {
            return Err(ConfigError::InvalidValue {
                field: "max_stack_size_bytes".into(),
                reason: "must be at least 64KB".into(),
            });
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.nodes_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "nodes_limit".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.thread_name_prefix.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "thread_name_prefix".into(),
            });
        }

        Ok(())
    }
}

fn override_field<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    if let Some(raw) = lookup(&key) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            field: key.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// Missing required field
    #[error("Missing required configuration field: {field}")]
    MissingField {
        /// The field name
        field: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_max_sessions_per_worker() -> usize {
    DEFAULT_MAX_SESSIONS_PER_WORKER
}

fn default_memory_limit() -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_max_stack_size() -> u64 {
    DEFAULT_MAX_STACK_SIZE_BYTES
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_nodes_limit() -> usize {
    DEFAULT_NODES_LIMIT
}

fn default_thread_name_prefix() -> String {
    DEFAULT_THREAD_NAME_PREFIX.to_string()
}
