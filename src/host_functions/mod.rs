//! Host functions exposed to the worker script.
//!
//! Every op is a plain Rust function over the [`EngineContext`] so it can be
//! tested without an engine. [`install`] wraps them into script functions
//! under `globalThis.__ops`; the bridge prelude turns those into the globals
//! a bundled library expects.

pub mod channel;
pub mod logging;
pub mod memory;
pub mod random;
pub mod timers;

use crate::context::{LogLevel, SharedEngineContext};
use rquickjs::function::Func;
use rquickjs::{Ctx, Exception, Object};
use std::rc::Rc;

/// Name of the global object holding the ops
pub const OPS_GLOBAL: &str = "__ops";

/// Op names, in the order they are installed
pub const OP_NAMES: &[&str] = &[
    "receive_wait",
    "send",
    "exit",
    "log",
    "get_random_bytes",
    "get_memory_usage",
    "timer_start",
    "timer_cancel",
];

/// Result type for host functions
pub type HostResult<T> = anyhow::Result<T>;

/// Turn an op failure into a thrown script exception
fn throw(ctx: &Ctx<'_>, err: anyhow::Error) -> rquickjs::Error {
    Exception::throw_message(ctx, &format!("{err:#}"))
}

/// Install every op on `globalThis.__ops`
pub fn install<'js>(ctx: &Ctx<'js>, engine: &SharedEngineContext) -> rquickjs::Result<()> {
    let ops = Object::new(ctx.clone())?;

    let e = Rc::clone(engine);
    ops.set(
        "receive_wait",
        Func::from(move |ctx: Ctx<'js>| -> rquickjs::Result<()> {
            channel::receive_wait(&e).map_err(|err| throw(&ctx, err))
        }),
    )?;

    let e = Rc::clone(engine);
    ops.set(
        "send",
        Func::from(move |ctx: Ctx<'js>, raw: String| -> rquickjs::Result<()> {
            channel::send(&e, &raw).map_err(|err| throw(&ctx, err))
        }),
    )?;

    let e = Rc::clone(engine);
    ops.set("exit", Func::from(move || channel::exit(&e)))?;

    let e = Rc::clone(engine);
    ops.set(
        "log",
        Func::from(move |level: String, message: String| {
            logging::log(&e, LogLevel::from(level.as_str()), &message);
        }),
    )?;

    ops.set(
        "get_random_bytes",
        Func::from(move |ctx: Ctx<'js>, len: f64| -> rquickjs::Result<Vec<u8>> {
            random::get_random_bytes(len).map_err(|err| throw(&ctx, err))
        }),
    )?;

    let e = Rc::clone(engine);
    ops.set(
        "get_memory_usage",
        Func::from(move |ctx: Ctx<'js>| -> rquickjs::Result<String> {
            memory::get_memory_usage(&e).map_err(|err| throw(&ctx, err))
        }),
    )?;

    let e = Rc::clone(engine);
    ops.set(
        "timer_start",
        Func::from(move |ctx: Ctx<'js>, delay_ms: f64| -> rquickjs::Result<u32> {
            timers::timer_start(&e, delay_ms).map_err(|err| throw(&ctx, err))
        }),
    )?;

    let e = Rc::clone(engine);
    ops.set(
        "timer_cancel",
        Func::from(move |id: f64| -> bool { timers::timer_cancel(&e, id) }),
    )?;

    ctx.globals().set(OPS_GLOBAL, ops)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::channel::ResponseRouter;
    use crate::context::{EngineContext, SharedEngineContext};
    use crate::metrics::WorkerMetrics;
    use std::sync::Arc;

    pub fn engine() -> SharedEngineContext {
        let metrics = Arc::new(WorkerMetrics::new());
        let router = Arc::new(ResponseRouter::new("test-worker".into(), 20, metrics.clone()));
        EngineContext::new("test-worker".into(), router, metrics)
    }
}
