//! Worker metrics for monitoring and observability.
//!
//! A [`WorkerMetrics`] collector is shared by a worker (or by every worker of
//! a pool) and updated from both the host tasks and the worker thread.

use crate::error::ErrorCode;
use crate::protocol::RequestKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of the collected metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Requests sent, by kind
    pub requests: HashMap<String, u64>,
    /// Requests answered with a success payload
    pub successes: u64,
    /// Requests answered with errors or failed on the host side
    pub failures: u64,
    /// Requests abandoned after the timeout
    pub timeouts: u64,
    /// Responses nobody was waiting for
    pub orphaned_responses: u64,
    /// Failures the script could not attribute to a request
    pub broadcast_failures: u64,
    /// Workers that reached `Terminated`
    pub worker_deaths: u64,
    /// Average request latency in microseconds
    pub avg_latency_us: f64,
    /// Highest heap usage observed
    pub peak_heap_bytes: u64,
    /// Failures by error code
    pub errors: HashMap<String, u64>,
}

/// Metrics collector for one worker or one pool
pub struct WorkerMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    orphaned_responses: AtomicU64,
    broadcast_failures: AtomicU64,
    worker_deaths: AtomicU64,
    completed: AtomicU64,
    total_latency_us: AtomicU64,
    peak_heap: AtomicU64,
    requests: parking_lot::Mutex<HashMap<RequestKind, u64>>,
    error_counts: parking_lot::Mutex<HashMap<ErrorCode, u64>>,
}

impl WorkerMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            orphaned_responses: AtomicU64::new(0),
            broadcast_failures: AtomicU64::new(0),
            worker_deaths: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            peak_heap: AtomicU64::new(0),
            requests: parking_lot::Mutex::new(HashMap::new()),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a request handed to a worker
    pub fn record_request(&self, kind: RequestKind) {
        *self.requests.lock().entry(kind).or_insert(0) += 1;
    }

    /// Record a successful response
    pub fn record_success(&self, latency: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// Record a failed request
    pub fn record_failure(&self, code: ErrorCode, latency: Duration) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
        *self.error_counts.lock().entry(code).or_insert(0) += 1;
    }

    /// Record an abandoned request
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        *self.error_counts.lock().entry(ErrorCode::Timeout).or_insert(0) += 1;
    }

    /// Record a response for an id nobody awaits
    pub fn record_orphan(&self) {
        self.orphaned_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unattributed script failure
    pub fn record_broadcast_failure(&self) {
        self.broadcast_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminated worker
    pub fn record_worker_death(&self) {
        self.worker_deaths.fetch_add(1, Ordering::Relaxed);
    }

    /// Observe a heap sample
    pub fn observe_heap(&self, used_bytes: u64) {
        self.peak_heap.fetch_max(used_bytes, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
    }

    /// Successful responses
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Failed requests
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Abandoned requests
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Discarded responses
    pub fn orphaned_responses(&self) -> u64 {
        self.orphaned_responses.load(Ordering::Relaxed)
    }

    /// Unattributed script failures
    pub fn broadcast_failures(&self) -> u64 {
        self.broadcast_failures.load(Ordering::Relaxed)
    }

    /// Terminated workers
    pub fn worker_deaths(&self) -> u64 {
        self.worker_deaths.load(Ordering::Relaxed)
    }

    /// Highest heap usage observed
    pub fn peak_heap(&self) -> u64 {
        self.peak_heap.load(Ordering::Relaxed)
    }

    /// Requests sent for one kind
    pub fn requests(&self, kind: RequestKind) -> u64 {
        self.requests.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Average latency in microseconds
    pub fn avg_latency_us(&self) -> f64 {
        let completed = self.completed.load(Ordering::Relaxed);
        if completed == 0 {
            0.0
        } else {
            self.total_latency_us.load(Ordering::Relaxed) as f64 / completed as f64
        }
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self
                .requests
                .lock()
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
            successes: self.successes(),
            failures: self.failures(),
            timeouts: self.timeouts(),
            orphaned_responses: self.orphaned_responses(),
            broadcast_failures: self.broadcast_failures(),
            worker_deaths: self.worker_deaths(),
            avg_latency_us: self.avg_latency_us(),
            peak_heap_bytes: self.peak_heap(),
            errors: self
                .error_counts
                .lock()
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
        }
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP federation_bridge_requests_total Requests sent to workers\n");
        output.push_str("# TYPE federation_bridge_requests_total counter\n");
        let mut kinds: Vec<_> = snapshot.requests.iter().collect();
        kinds.sort();
        for (kind, count) in kinds {
            output.push_str(&format!(
                "federation_bridge_requests_total{{kind=\"{}\"}} {}\n",
                kind, count
            ));
        }

        output.push_str("\n# HELP federation_bridge_responses_total Completed requests\n");
        output.push_str("# TYPE federation_bridge_responses_total counter\n");
        output.push_str(&format!(
            "federation_bridge_responses_total{{status=\"success\"}} {}\n",
            snapshot.successes
        ));
        output.push_str(&format!(
            "federation_bridge_responses_total{{status=\"error\"}} {}\n",
            snapshot.failures
        ));
        output.push_str(&format!(
            "federation_bridge_responses_total{{status=\"timeout\"}} {}\n",
            snapshot.timeouts
        ));

        output.push_str("\n# HELP federation_bridge_orphaned_responses_total Responses nobody awaited\n");
        output.push_str("# TYPE federation_bridge_orphaned_responses_total counter\n");
        output.push_str(&format!(
            "federation_bridge_orphaned_responses_total {}\n",
            snapshot.orphaned_responses
        ));

        output.push_str("\n# HELP federation_bridge_broadcast_failures_total Unattributed script failures\n");
        output.push_str("# TYPE federation_bridge_broadcast_failures_total counter\n");
        output.push_str(&format!(
            "federation_bridge_broadcast_failures_total {}\n",
            snapshot.broadcast_failures
        ));

        output.push_str("\n# HELP federation_bridge_worker_deaths_total Terminated workers\n");
        output.push_str("# TYPE federation_bridge_worker_deaths_total counter\n");
        output.push_str(&format!(
            "federation_bridge_worker_deaths_total {}\n",
            snapshot.worker_deaths
        ));

        output.push_str("\n# HELP federation_bridge_request_latency_us Average request latency\n");
        output.push_str("# TYPE federation_bridge_request_latency_us gauge\n");
        output.push_str(&format!(
            "federation_bridge_request_latency_us {:.2}\n",
            snapshot.avg_latency_us
        ));

        output.push_str("\n# HELP federation_bridge_peak_heap_bytes Peak engine heap usage\n");
        output.push_str("# TYPE federation_bridge_peak_heap_bytes gauge\n");
        output.push_str(&format!(
            "federation_bridge_peak_heap_bytes {}\n",
            snapshot.peak_heap_bytes
        ));

        // Errors
        output.push_str("\n# HELP federation_bridge_errors_total Error counts by code\n");
        output.push_str("# TYPE federation_bridge_errors_total counter\n");
        let mut codes: Vec<_> = snapshot.errors.iter().collect();
        codes.sort();
        for (code, count) in codes {
            output.push_str(&format!(
                "federation_bridge_errors_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
