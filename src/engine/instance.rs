//! Engine instance and worker thread.
//!
//! Each worker owns one QuickJS runtime and context driven by a dedicated OS
//! thread. The thread runs a single-threaded event loop: it drains promise
//! jobs, fires due timers and, while the script waits in `receive()`, hands
//! it the next queued envelope. The loop returns once the script leaves its
//! request loop, once it neither waits for a message nor has a timer pending,
//! or as soon as the engine reports a failure it can't recover from.

use super::payload::ScriptPayload;
use crate::channel::ResponseRouter;
use crate::config::BridgeConfig;
use crate::context::{EngineContext, ScriptExit, SharedEngineContext, TimerId};
use crate::error::{BridgeError, Result};
use crate::host_functions::{self, memory};
use crate::metrics::WorkerMetrics;
use crate::protocol::WorkerId;
use crate::translate::{translate_all, EngineError, ErrorObject};
use rquickjs::convert::Coerced;
use rquickjs::{Context, Ctx, FromJs, Function, Object, Runtime, Value};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, info, warn};

/// Script function that resolves the pending `receive()`
const DELIVER_HOOK: &str = "__bridge_deliver";

/// Script function that runs a timer callback
const TIMER_HOOK: &str = "__bridge_fire_timer";

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    /// Thread started, payload not yet evaluated
    Uninitialized,
    /// Accepting requests
    Running,
    /// Refusing requests, event loop winding down
    Draining,
    /// Event loop returned, engine freed
    Terminated,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Uninitialized => write!(f, "uninitialized"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why the event loop returned
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    /// The script left its request loop
    Returned,
    /// Forced teardown
    Interrupted,
    /// Every request queue sender was dropped
    Disconnected,
    /// The payload failed to evaluate
    Failed,
    /// Out of memory or a similar engine failure
    Fatal {
        /// What went wrong
        reason: String,
        /// Translated engine errors
        errors: Vec<EngineError>,
    },
}

impl LoopExit {
    /// Reason reported to pending awaiters
    pub fn reason(&self) -> &str {
        match self {
            LoopExit::Returned => "script left its request loop",
            LoopExit::Interrupted => "worker was interrupted",
            LoopExit::Disconnected => "request queue was closed",
            LoopExit::Failed => "worker failed to initialize",
            LoopExit::Fatal { reason, .. } => reason,
        }
    }
}

impl From<ScriptExit> for LoopExit {
    fn from(exit: ScriptExit) -> Self {
        match exit {
            ScriptExit::Finished => LoopExit::Returned,
            ScriptExit::Fatal { reason, errors } => LoopExit::Fatal { reason, errors },
        }
    }
}

/// State shared by the supervisor and the worker thread
pub struct WorkerShared {
    pub(crate) id: WorkerId,
    pub(crate) router: Arc<ResponseRouter>,
    pub(crate) metrics: Arc<WorkerMetrics>,
    state: watch::Sender<WorkerState>,
    interrupt: Arc<AtomicBool>,
    wake: Notify,
}

impl WorkerShared {
    /// Create the shared state of a new worker
    pub fn new(id: WorkerId, router: Arc<ResponseRouter>, metrics: Arc<WorkerMetrics>) -> Self {
        let (state, _) = watch::channel(WorkerState::Uninitialized);
        Self {
            id,
            router,
            metrics,
            state,
            interrupt: Arc::new(AtomicBool::new(false)),
            wake: Notify::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Move forward to `next`. Backward moves are ignored.
    pub fn advance(&self, next: WorkerState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if next > *state {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(previous) = previous {
            info!(worker_id = %self.id, from = %previous, to = %next, "worker state changed");
        }
        changed
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Abort whatever the script runs and stop the event loop
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Whether [`interrupt`](Self::interrupt) was called
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

struct EngineLimits {
    memory_limit: usize,
    max_stack_size: usize,
    nodes_limit: usize,
}

impl From<&BridgeConfig> for EngineLimits {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            memory_limit: usize::try_from(config.memory_limit_bytes).unwrap_or(usize::MAX),
            max_stack_size: usize::try_from(config.max_stack_size_bytes).unwrap_or(usize::MAX),
            nodes_limit: config.nodes_limit,
        }
    }
}

/// Start the worker thread and wait until the payload has been evaluated
pub(crate) async fn launch(
    payload: Arc<ScriptPayload>,
    config: &BridgeConfig,
    shared: Arc<WorkerShared>,
    inbound: mpsc::UnboundedReceiver<String>,
) -> Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let limits = EngineLimits::from(config);
    let short_id = shared.id.get(..8).unwrap_or(&shared.id);
    let thread_name = format!("{}-{}", config.thread_name_prefix, short_id);
    let thread_shared = Arc::clone(&shared);

    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || run(payload, limits, thread_shared, inbound, ready_tx))
        .map_err(|e| BridgeError::Initialization {
            message: format!("couldn't spawn worker thread: {e}"),
            errors: Vec::new(),
        })?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(BridgeError::Initialization {
            message: "worker thread exited before it was ready".into(),
            errors: Vec::new(),
        }),
    }
}

fn run(
    payload: Arc<ScriptPayload>,
    limits: EngineLimits,
    shared: Arc<WorkerShared>,
    inbound: mpsc::UnboundedReceiver<String>,
    ready: oneshot::Sender<Result<()>>,
) {
    let exit = serve(&payload, &limits, &shared, inbound, ready);

    shared.advance(WorkerState::Draining);
    let failed = match &exit {
        LoopExit::Fatal { reason, errors } => {
            error!(worker_id = %shared.id, reason = %reason, "worker hit a fatal engine error");
            shared.router.close_with(reason, errors.clone())
        }
        _ => shared.router.close(exit.reason()),
    };
    if failed > 0 {
        warn!(worker_id = %shared.id, failed, reason = exit.reason(), "failed pending requests");
    }
    shared.metrics.record_worker_death();
    shared.advance(WorkerState::Terminated);
    info!(worker_id = %shared.id, reason = exit.reason(), "worker stopped");
}

fn serve(
    payload: &ScriptPayload,
    limits: &EngineLimits,
    shared: &WorkerShared,
    inbound: mpsc::UnboundedReceiver<String>,
    ready: oneshot::Sender<Result<()>>,
) -> LoopExit {
    let started = Instant::now();
    let booted = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| BridgeError::Initialization {
            message: format!("couldn't build worker executor: {e}"),
            errors: Vec::new(),
        })
        .and_then(|executor| Ok((executor, Instance::boot(payload, limits, shared)?)));

    let (executor, instance) = match booted {
        Ok(booted) => booted,
        Err(err) => {
            error!(worker_id = %shared.id, error = %err, "worker failed to initialize");
            let _ = ready.send(Err(err));
            return LoopExit::Failed;
        }
    };

    info!(
        worker_id = %shared.id,
        fingerprint = payload.short_fingerprint(),
        boot_ms = started.elapsed().as_millis() as u64,
        "worker ready"
    );
    shared.advance(WorkerState::Running);
    let _ = ready.send(Ok(()));

    executor.block_on(instance.run_loop(inbound, shared))
}

/// One QuickJS runtime and context plus the bindings of its ops
struct Instance {
    // Field order matters: the context must be freed before its runtime.
    context: Context,
    runtime: Runtime,
    engine: SharedEngineContext,
    nodes_limit: usize,
}

impl Instance {
    fn boot(payload: &ScriptPayload, limits: &EngineLimits, shared: &WorkerShared) -> Result<Self> {
        let init_err = |what: &str, e: rquickjs::Error| BridgeError::Initialization {
            message: format!("{what}: {e}"),
            errors: Vec::new(),
        };

        let runtime = Runtime::new().map_err(|e| init_err("couldn't create engine runtime", e))?;
        runtime.set_memory_limit(limits.memory_limit);
        runtime.set_max_stack_size(limits.max_stack_size);
        let flag = Arc::clone(&shared.interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));

        let context =
            Context::full(&runtime).map_err(|e| init_err("couldn't create engine context", e))?;
        let engine = EngineContext::new(
            shared.id.clone(),
            Arc::clone(&shared.router),
            Arc::clone(&shared.metrics),
        );

        let instance = Self {
            context,
            runtime,
            engine,
            nodes_limit: limits.nodes_limit,
        };
        instance.evaluate(payload)?;
        instance.drain_jobs(shared);
        instance.sample_heap();
        Ok(instance)
    }

    fn evaluate(&self, payload: &ScriptPayload) -> Result<()> {
        self.context.with(|ctx| {
            host_functions::install(&ctx, &self.engine)
                .map_err(|err| self.init_failure(&ctx, "couldn't install host ops", err))?;

            for source in payload.sources() {
                let started = Instant::now();
                ctx.eval::<(), _>(source.code.as_str()).map_err(|err| {
                    self.init_failure(&ctx, &format!("{} failed to evaluate", source.name), err)
                })?;
                debug!(
                    worker_id = %self.engine.worker_id,
                    source = %source.name,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "evaluated script source"
                );
            }
            Ok(())
        })
    }

    fn init_failure(&self, ctx: &Ctx<'_>, what: &str, err: rquickjs::Error) -> BridgeError {
        let object = caught(ctx, err);
        let detail = object.message.clone().unwrap_or_default();
        BridgeError::Initialization {
            message: format!("{what}: {detail}"),
            errors: translate_all(vec![object], self.nodes_limit),
        }
    }

    async fn run_loop(
        &self,
        mut inbound: mpsc::UnboundedReceiver<String>,
        shared: &WorkerShared,
    ) -> LoopExit {
        loop {
            if shared.is_interrupted() {
                return LoopExit::Interrupted;
            }

            self.drain_jobs(shared);
            if let Some(exit) = self.engine.take_exit() {
                return exit.into();
            }

            let due = self.engine.due_timers(Instant::now());
            if !due.is_empty() {
                for id in due {
                    self.fire_timer(id);
                }
                continue;
            }
            if self.runtime.is_job_pending() {
                continue;
            }

            self.sample_heap();

            let waiting = self.engine.is_receive_waiting();
            let sleep_at = self
                .engine
                .next_timer_deadline()
                .map(tokio::time::Instant::from_std);
            if !waiting && sleep_at.is_none() {
                return LoopExit::Returned;
            }

            tokio::select! {
                biased;
                _ = shared.wake.notified() => {}
                message = inbound.recv(), if waiting => match message {
                    Some(raw) => self.deliver(raw),
                    None => return LoopExit::Disconnected,
                },
                _ = tokio::time::sleep_until(sleep_at.unwrap_or_else(tokio::time::Instant::now)),
                    if sleep_at.is_some() => {}
            }
        }
    }

    fn drain_jobs(&self, shared: &WorkerShared) {
        while !shared.is_interrupted() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    let object = self.context.with(|ctx| error_object(&ctx, ctx.catch()));
                    warn!(
                        worker_id = %self.engine.worker_id,
                        error = object.message.as_deref().unwrap_or_default(),
                        "promise job threw"
                    );
                    self.check_fatal(object);
                }
            }
        }
    }

    fn sample_heap(&self) {
        self.engine.record_heap(memory::sample(&self.runtime));
    }

    fn deliver(&self, raw: String) {
        self.engine.take_receive();
        debug!(worker_id = %self.engine.worker_id, bytes = raw.len(), "delivering message");
        if let Some(object) = self.call_hook(DELIVER_HOOK, raw) {
            error!(
                worker_id = %self.engine.worker_id,
                error = object.message.as_deref().unwrap_or_default(),
                "couldn't deliver message to the script"
            );
            self.check_fatal(object);
        }
    }

    fn fire_timer(&self, id: TimerId) {
        if let Some(object) = self.call_hook(TIMER_HOOK, id) {
            warn!(
                worker_id = %self.engine.worker_id,
                timer = id,
                error = object.message.as_deref().unwrap_or_default(),
                "timer callback threw"
            );
            self.check_fatal(object);
        }
    }

    // Errors that escape the worker loop never reach the router, so engine
    // failures among them are detected here.
    fn check_fatal(&self, object: ErrorObject) {
        if object.is_fatal_engine_error() {
            let errors = translate_all(vec![object], self.nodes_limit);
            let detail = errors.first().map(ToString::to_string).unwrap_or_default();
            let reason = format!("engine failure: {detail}");
            self.engine.request_exit(ScriptExit::Fatal { reason, errors });
        }
    }

    fn call_hook<A>(&self, hook: &str, arg: A) -> Option<ErrorObject>
    where
        A: for<'js> rquickjs::IntoJs<'js>,
    {
        self.context.with(|ctx| {
            let result = ctx
                .globals()
                .get::<_, Function>(hook)
                .and_then(|function| function.call::<_, ()>((arg,)));
            result.err().map(|err| caught(&ctx, err))
        })
    }
}

/// Convert an engine error into a serialized throwable
pub(crate) fn caught(ctx: &Ctx<'_>, err: rquickjs::Error) -> ErrorObject {
    if matches!(err, rquickjs::Error::Exception) {
        error_object(ctx, ctx.catch())
    } else {
        ErrorObject::new("InternalError", err.to_string())
    }
}

/// Read a thrown script value into an [`ErrorObject`]
pub(crate) fn error_object<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> ErrorObject {
    let Some(object) = value.as_object() else {
        let message = Coerced::<String>::from_js(ctx, value)
            .map(|coerced| coerced.0)
            .unwrap_or_else(|_| "unknown exception".to_string());
        return ErrorObject::new("Error", message);
    };

    // Enumerable fields (locations, extensions, ...) survive JSON; name,
    // message and stack are own non-enumerable properties and are read directly.
    let mut out: ErrorObject = ctx
        .json_stringify(value.clone())
        .ok()
        .flatten()
        .and_then(|json| json.to_string().ok())
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    out.name = out.name.or_else(|| string_property(object, "name"));
    out.message = out.message.or_else(|| string_property(object, "message"));
    out.stack = out.stack.or_else(|| string_property(object, "stack"));
    out
}

fn string_property(object: &Object<'_>, key: &str) -> Option<String> {
    object
        .get::<_, Option<Coerced<String>>>(key)
        .ok()
        .flatten()
        .map(|coerced| coerced.0)
}
