//! Message channel host functions.
//!
//! `receive_wait` only flags the script as waiting; the event loop resolves
//! the pending `receive()` promise when the next envelope arrives. `send`
//! hands a response envelope to the router synchronously. `exit` tells the
//! event loop the script left its request loop.

use super::HostResult;
use crate::channel::RouteOutcome;
use crate::context::{EngineContext, ScriptExit};
use tracing::{debug, info};

/// Mark the script as waiting for the next message
///
/// # Returns
/// * `Ok(())` - The event loop will deliver the next message
/// * `Err(_)` - A receive is already pending
pub fn receive_wait(ctx: &EngineContext) -> HostResult<()> {
    if !ctx.begin_receive() {
        anyhow::bail!("receive() is already pending");
    }
    Ok(())
}

/// Route a serialized response envelope
///
/// # Arguments
/// * `ctx` - The engine context
/// * `raw` - `{ id?, payload }` as JSON
///
/// # Returns
/// * `Ok(())` - Delivered, discarded as an orphan, broadcast as a failure,
///   or recognized as an engine failure that stops the worker
/// * `Err(_)` - The envelope could not be decoded
pub fn send(ctx: &EngineContext, raw: &str) -> HostResult<()> {
    match ctx.router.route(raw)? {
        RouteOutcome::Broadcast(failed) => {
            debug!(worker_id = %ctx.worker_id, failed, "failed pending requests");
        }
        RouteOutcome::Fatal(fatal) => {
            ctx.request_exit(ScriptExit::Fatal {
                reason: format!("engine failure: {fatal}"),
                errors: fatal.errors,
            });
        }
        RouteOutcome::Delivered | RouteOutcome::Orphaned => {}
    }
    Ok(())
}

/// The script left its request loop; the event loop stops even with timers pending
pub fn exit(ctx: &EngineContext) {
    info!(worker_id = %ctx.worker_id, "script left its request loop");
    ctx.request_exit(ScriptExit::Finished);
}
