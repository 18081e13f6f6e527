//! Per-worker engine context.
//!
//! [`EngineContext`] holds every binding the host ops need while the script
//! runs: the worker id, the response router, the receive-wait flag, the timer
//! queue, the last heap sample and whether the script asked to stop. It is
//! built once per spawn and lives on the worker thread only.

use crate::channel::ResponseRouter;
use crate::metrics::WorkerMetrics;
use crate::protocol::{HeapStatistics, WorkerId};
use crate::translate::EngineError;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Log levels accepted by the `log` op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level
    Error,
}

impl From<&str> for LogLevel {
    fn from(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Why the script asked the event loop to stop
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptExit {
    /// The script left its request loop
    Finished,
    /// The engine failed in a way the context can't recover from
    Fatal {
        /// Short description for pending awaiters
        reason: String,
        /// Translated engine errors
        errors: Vec<EngineError>,
    },
}

/// Timer id handed to the script
pub type TimerId = u32;

/// Host-side queue backing `setTimeout`
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: TimerId,
    by_deadline: BTreeSet<(Instant, TimerId)>,
    deadlines: HashMap<TimerId, Instant>,
}

impl TimerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer `delay` from now
    pub fn start(&mut self, delay: Duration) -> TimerId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        let deadline = Instant::now() + delay;
        self.by_deadline.insert((deadline, id));
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a timer; false if it already fired or never existed
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.by_deadline.remove(&(deadline, id)),
            None => false,
        }
    }

    /// Remove and return the timers due at `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(&(deadline, id)) = self.by_deadline.first() {
            if deadline > now {
                break;
            }
            self.by_deadline.remove(&(deadline, id));
            self.deadlines.remove(&id);
            due.push(id);
        }
        due
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.first().map(|(deadline, _)| *deadline)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether no timer is pending
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Bindings shared by the host ops of one worker
pub struct EngineContext {
    /// Worker this context belongs to
    pub worker_id: WorkerId,
    /// Where `send` delivers responses
    pub router: Arc<ResponseRouter>,
    /// Metrics of the worker
    pub metrics: Arc<WorkerMetrics>,
    receive_waiting: Cell<bool>,
    timers: RefCell<TimerQueue>,
    heap: Cell<HeapStatistics>,
    exit: RefCell<Option<ScriptExit>>,
}

/// Handle captured by every op closure
pub type SharedEngineContext = Rc<EngineContext>;

impl EngineContext {
    /// Create the context of a worker
    pub fn new(
        worker_id: WorkerId,
        router: Arc<ResponseRouter>,
        metrics: Arc<WorkerMetrics>,
    ) -> SharedEngineContext {
        Rc::new(Self {
            worker_id,
            router,
            metrics,
            receive_waiting: Cell::new(false),
            timers: RefCell::new(TimerQueue::new()),
            heap: Cell::new(HeapStatistics::default()),
            exit: RefCell::new(None),
        })
    }

    /// Mark the script as waiting for the next message.
    /// Returns false if it was already waiting.
    pub fn begin_receive(&self) -> bool {
        !self.receive_waiting.replace(true)
    }

    /// Whether the script waits for a message
    pub fn is_receive_waiting(&self) -> bool {
        self.receive_waiting.get()
    }

    /// Clear the wait flag before handing a message over
    pub fn take_receive(&self) -> bool {
        self.receive_waiting.replace(false)
    }

    /// Ask the event loop to stop. A fatal exit is never downgraded.
    pub fn request_exit(&self, exit: ScriptExit) {
        let mut current = self.exit.borrow_mut();
        if !matches!(*current, Some(ScriptExit::Fatal { .. })) {
            *current = Some(exit);
        }
    }

    /// Exit requested by the script, if any
    pub fn take_exit(&self) -> Option<ScriptExit> {
        self.exit.borrow_mut().take()
    }

    /// Schedule a timer
    pub fn start_timer(&self, delay: Duration) -> TimerId {
        self.timers.borrow_mut().start(delay)
    }

    /// Cancel a timer
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    /// Pop timers due at `now`
    pub fn due_timers(&self, now: Instant) -> Vec<TimerId> {
        self.timers.borrow_mut().take_due(now)
    }

    /// Earliest pending timer deadline
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.borrow().next_deadline()
    }

    /// Store a heap sample taken outside the engine lock
    pub fn record_heap(&self, sample: HeapStatistics) {
        self.metrics.observe_heap(sample.heap_used);
        self.heap.set(sample);
    }

    /// Last heap sample
    pub fn heap(&self) -> HeapStatistics {
        self.heap.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SharedEngineContext {
        let metrics = Arc::new(WorkerMetrics::new());
        let router = Arc::new(ResponseRouter::new("w".into(), 20, metrics.clone()));
        EngineContext::new("w".into(), router, metrics)
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::from("trace"), LogLevel::Trace);
        assert_eq!(LogLevel::from("verbose"), LogLevel::Info);
    }

    #[test]
    fn test_timer_ordering() {
        let mut timers = TimerQueue::new();
        let late = timers.start(Duration::from_secs(60));
        let soon = timers.start(Duration::ZERO);
        let also_soon = timers.start(Duration::ZERO);

        let due = timers.take_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(due, vec![soon, also_soon]);
        assert_eq!(timers.len(), 1);
        assert!(timers.next_deadline().is_some());
        assert!(timers.cancel(late));
        assert!(!timers.cancel(late));
        assert!(timers.is_empty());
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_receive_flag() {
        let ctx = context();
        assert!(!ctx.is_receive_waiting());
        assert!(ctx.begin_receive());
        assert!(!ctx.begin_receive());
        assert!(ctx.take_receive());
        assert!(!ctx.take_receive());
    }

    #[test]
    fn test_fatal_exit_is_kept() {
        let ctx = context();
        assert_eq!(ctx.take_exit(), None);

        ctx.request_exit(ScriptExit::Fatal {
            reason: "out of memory".into(),
            errors: Vec::new(),
        });
        ctx.request_exit(ScriptExit::Finished);
        assert!(matches!(ctx.take_exit(), Some(ScriptExit::Fatal { .. })));

        ctx.request_exit(ScriptExit::Finished);
        assert_eq!(ctx.take_exit(), Some(ScriptExit::Finished));
    }

    #[test]
    fn test_heap_sample_feeds_metrics() {
        let ctx = context();
        ctx.record_heap(HeapStatistics {
            heap_total: 10,
            heap_used: 7,
            external: 1,
        });
        assert_eq!(ctx.heap().heap_used, 7);
        assert_eq!(ctx.metrics.peak_heap(), 7);
    }
}
