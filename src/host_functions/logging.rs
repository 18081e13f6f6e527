//! Logging host function.
//!
//! Script `console.*` calls and `bridge.log` end up here and are emitted as
//! `tracing` events carrying the worker id. Logging never fails.

use crate::context::{EngineContext, LogLevel};

/// Tracing target of script log lines
pub const SCRIPT_LOG_TARGET: &str = "federation_bridge::script";

/// Log a message from the script
///
/// # Arguments
/// * `ctx` - The engine context
/// * `level` - The log level
/// * `message` - The message to log
pub fn log(ctx: &EngineContext, level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(
            target: SCRIPT_LOG_TARGET,
            worker_id = %ctx.worker_id,
            "{}",
            message
        ),
        LogLevel::Debug => tracing::debug!(
            target: SCRIPT_LOG_TARGET,
            worker_id = %ctx.worker_id,
            "{}",
            message
        ),
        LogLevel::Info => tracing::info!(
            target: SCRIPT_LOG_TARGET,
            worker_id = %ctx.worker_id,
            "{}",
            message
        ),
        LogLevel::Warn => tracing::warn!(
            target: SCRIPT_LOG_TARGET,
            worker_id = %ctx.worker_id,
            "{}",
            message
        ),
        LogLevel::Error => tracing::error!(
            target: SCRIPT_LOG_TARGET,
            worker_id = %ctx.worker_id,
            "{}",
            message
        ),
    }
}
