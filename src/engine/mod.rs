//! Worker supervision.
//!
//! A [`Worker`] owns one engine thread. Callers hand it requests with
//! [`Worker::send`], which returns a [`PendingResponse`] carrying the
//! correlation id, and collect the reply with [`Worker::await_response`];
//! every request that expects a reply is completed exactly once, with the
//! script's answer, a timeout, or a worker failure. Dropping a
//! [`PendingResponse`] gives up on its reply.

pub mod instance;
pub mod payload;
pub mod pool;

use crate::channel::{RequestQueue, ResponseResult, ResponseRouter};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::metrics::WorkerMetrics;
use crate::protocol::{
    CorrelationId, HeapStatistics, RequestKind, RequestPayload, SchemaId, WorkerId, WorkerResult,
};
use crate::translate::encode_request;
use chrono::{DateTime, Utc};
use instance::{WorkerShared, WorkerState};
use parking_lot::Mutex;
use payload::ScriptPayload;
use pool::WorkerPool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Reply slot of one request sent with [`Worker::send`]
#[must_use = "the reply is only collected by `Worker::await_response`"]
pub struct PendingResponse {
    id: CorrelationId,
    worker_id: WorkerId,
    kind: RequestKind,
    sent_at: Instant,
    // None for requests that expect no reply, and once awaited
    receiver: Option<oneshot::Receiver<ResponseResult>>,
    router: Arc<ResponseRouter>,
}

impl PendingResponse {
    /// Correlation id of the request
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kind of the request
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Worker the request was sent to
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.router.forget(&self.id) {
            debug!(worker_id = %self.worker_id, correlation_id = %self.id, "reply abandoned");
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("worker_id", &self.worker_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Handle to one engine thread
pub struct Worker {
    shared: Arc<WorkerShared>,
    queue: RequestQueue,
    config: BridgeConfig,
    fingerprint: String,
    started_at: DateTime<Utc>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Start a worker and evaluate `payload` in it.
    ///
    /// Resolves once the worker is `Running`. A payload that throws while
    /// evaluating yields [`BridgeError::Initialization`] with the translated
    /// exception.
    pub async fn spawn(payload: impl Into<Arc<ScriptPayload>>, config: BridgeConfig) -> Result<Self> {
        Self::spawn_with_metrics(payload.into(), config, Arc::new(WorkerMetrics::new())).await
    }

    pub(crate) async fn spawn_with_metrics(
        payload: Arc<ScriptPayload>,
        config: BridgeConfig,
        metrics: Arc<WorkerMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let id: WorkerId = uuid::Uuid::new_v4().to_string();
        let router = Arc::new(ResponseRouter::new(
            id.clone(),
            config.nodes_limit,
            Arc::clone(&metrics),
        ));
        let shared = Arc::new(WorkerShared::new(id, router, metrics));
        let (queue, inbound) = RequestQueue::channel();
        let fingerprint = payload.fingerprint().to_string();

        info!(
            worker_id = %shared.id,
            fingerprint = payload.short_fingerprint(),
            memory_limit = config.memory_limit_bytes,
            "starting worker"
        );

        let thread = instance::launch(payload, &config, Arc::clone(&shared), inbound).await?;

        Ok(Self {
            shared,
            queue,
            config,
            fingerprint,
            started_at: Utc::now(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Enqueue a request without waiting for its reply.
    ///
    /// Pass the returned handle to [`await_response`](Self::await_response).
    /// `Exit` requests expect no reply, so their handle cannot be awaited.
    #[instrument(skip(self, payload), fields(worker_id = %self.shared.id, kind = %payload.kind()))]
    pub fn send(&self, payload: RequestPayload) -> Result<PendingResponse> {
        let state = self.state();
        if state != WorkerState::Running {
            return Err(BridgeError::NotRunning {
                worker_id: self.shared.id.clone(),
                state,
            });
        }

        let kind = payload.kind();
        let id: CorrelationId = uuid::Uuid::new_v4().to_string();
        let nodes_limit = payload.nodes_limit().unwrap_or(self.config.nodes_limit);
        let mut pending = PendingResponse {
            id,
            worker_id: self.shared.id.clone(),
            kind,
            sent_at: Instant::now(),
            receiver: None,
            router: Arc::clone(&self.shared.router),
        };

        if !kind.expects_reply() {
            let raw = encode_request(None, &payload, nodes_limit)?;
            self.push(raw)?;
            self.shared.metrics.record_request(kind);
            debug!(correlation_id = %pending.id, "sent request without reply");
            return Ok(pending);
        }

        let raw = encode_request(Some(&pending.id), &payload, nodes_limit)?;
        let receiver = self
            .shared
            .router
            .register(pending.id.clone(), kind, Some(nodes_limit))?;
        pending.receiver = Some(receiver);
        // on failure the dropped handle forgets the id
        self.push(raw)?;
        self.shared.metrics.record_request(kind);
        debug!(correlation_id = %pending.id, "sent request");
        Ok(pending)
    }

    fn push(&self, raw: String) -> Result<()> {
        self.queue.push(raw).map_err(|_| BridgeError::WorkerDied {
            worker_id: self.shared.id.clone(),
            reason: "request queue is closed".into(),
            errors: Vec::new(),
        })
    }

    /// Wait for the reply to a request sent with [`send`](Self::send).
    ///
    /// Gives up after the configured request timeout; a reply arriving later
    /// is discarded as an orphan.
    pub async fn await_response(&self, mut pending: PendingResponse) -> Result<WorkerResult> {
        let receiver = match pending.receiver.take() {
            Some(receiver) if pending.worker_id == self.shared.id => receiver,
            other => {
                pending.receiver = other;
                return Err(BridgeError::UnknownCorrelationId(pending.id.clone()));
            }
        };
        let id = pending.id.as_str();

        let timeout_ms = self.config.request_timeout_ms;
        let outcome = timeout(Duration::from_millis(timeout_ms), receiver).await;
        let latency = pending.sent_at.elapsed();

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::WorkerDied {
                worker_id: self.shared.id.clone(),
                reason: "response channel was dropped".into(),
                errors: Vec::new(),
            }),
            Err(_) => {
                self.shared.router.forget(id);
                self.shared.metrics.record_timeout();
                warn!(
                    worker_id = %self.shared.id,
                    correlation_id = %id,
                    kind = %pending.kind,
                    timeout_ms,
                    "request timed out"
                );
                return Err(BridgeError::Timeout {
                    correlation_id: id.to_string(),
                    timeout_ms,
                });
            }
        };

        match &result {
            Ok(_) => self.shared.metrics.record_success(latency),
            Err(err) => {
                self.shared.metrics.record_failure(err.code(), latency);
                debug!(
                    worker_id = %self.shared.id,
                    correlation_id = %id,
                    kind = %pending.kind,
                    error = %err,
                    "request failed"
                );
            }
        }
        result
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, payload: RequestPayload) -> Result<WorkerResult> {
        no_reply_guard(&payload)?;
        let pending = self.send(payload)?;
        self.await_response(pending).await
    }

    /// Drop the session `schema_id`.
    ///
    /// The worker keeps running while other sessions remain and stops once
    /// its last session exits.
    pub fn exit_session(&self, schema_id: SchemaId) -> Result<()> {
        self.send(RequestPayload::Exit {
            schema_id: Some(schema_id),
        })
        .map(|_| ())
    }

    /// Current heap usage of the engine
    pub async fn heap_statistics(&self) -> Result<HeapStatistics> {
        match self.request(RequestPayload::GetHeapStatistics).await? {
            WorkerResult::HeapStatistics(stats) => Ok(stats),
            other => Err(BridgeError::Protocol(format!(
                "expected heap statistics, got a {} response",
                other.kind()
            ))),
        }
    }

    /// Stop the worker.
    ///
    /// Asks the script to leave its loop, then waits up to the shutdown grace
    /// period. A worker that is still busy after that is interrupted and every
    /// pending request fails with [`BridgeError::WorkerDied`].
    pub async fn shutdown(&self) -> Result<()> {
        if self.state() == WorkerState::Terminated {
            self.join_thread().await;
            return Ok(());
        }

        info!(worker_id = %self.shared.id, "shutting down worker");
        self.shared.advance(WorkerState::Draining);
        let exit = encode_request(
            None,
            &RequestPayload::Exit { schema_id: None },
            self.config.nodes_limit,
        )?;
        let _ = self.queue.push(exit);

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if timeout(grace, self.terminated()).await.is_err() {
            warn!(
                worker_id = %self.shared.id,
                grace_ms = self.config.shutdown_grace_ms,
                "worker did not stop within the grace period, interrupting"
            );
            self.shared.interrupt();
            self.shared
                .router
                .close("worker was interrupted after the shutdown grace period");
            self.terminated().await;
        }

        self.join_thread().await;
        Ok(())
    }

    async fn join_thread(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if let Ok(Err(_)) = tokio::task::spawn_blocking(move || handle.join()).await {
            warn!(worker_id = %self.shared.id, "worker thread panicked");
        }
    }

    /// Resolve once the worker is `Terminated`
    pub async fn terminated(&self) {
        let mut state = self.shared.subscribe();
        let _ = state
            .wait_for(|state| *state == WorkerState::Terminated)
            .await;
    }

    /// Worker identifier
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.shared.router.pending_count()
    }

    /// Metrics of this worker
    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.shared.metrics
    }

    /// SHA-256 fingerprint of the loaded payload
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// When the worker became ready
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Configuration the worker was started with
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

pub(crate) fn no_reply_guard(payload: &RequestPayload) -> Result<()> {
    let kind = payload.kind();
    if kind.expects_reply() {
        Ok(())
    } else {
        Err(BridgeError::Protocol(format!(
            "{kind} requests expect no reply; send them without awaiting"
        )))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.state() != WorkerState::Terminated {
            debug!(worker_id = %self.shared.id, "worker handle dropped, interrupting");
            self.shared.interrupt();
            self.shared.router.close("worker handle was dropped");
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

/// Where a planner sends its requests
#[derive(Clone)]
pub enum PlannerBackend {
    /// A single dedicated worker
    Worker(Arc<Worker>),
    /// A pool of workers with session affinity
    Pool(Arc<WorkerPool>),
}

impl PlannerBackend {
    /// Send a request and wait for its reply
    pub async fn request(&self, payload: RequestPayload) -> Result<WorkerResult> {
        match self {
            PlannerBackend::Worker(worker) => worker.request(payload).await,
            PlannerBackend::Pool(pool) => pool.request(payload).await,
        }
    }

    /// Drop a session
    pub fn exit_session(&self, schema_id: SchemaId) -> Result<()> {
        match self {
            PlannerBackend::Worker(worker) => worker.exit_session(schema_id),
            PlannerBackend::Pool(pool) => pool.exit_session(schema_id),
        }
    }
}

impl From<Arc<Worker>> for PlannerBackend {
    fn from(worker: Arc<Worker>) -> Self {
        PlannerBackend::Worker(worker)
    }
}

impl From<Worker> for PlannerBackend {
    fn from(worker: Worker) -> Self {
        PlannerBackend::Worker(Arc::new(worker))
    }
}

impl From<Arc<WorkerPool>> for PlannerBackend {
    fn from(pool: Arc<WorkerPool>) -> Self {
        PlannerBackend::Pool(pool)
    }
}

impl From<WorkerPool> for PlannerBackend {
    fn from(pool: WorkerPool) -> Self {
        PlannerBackend::Pool(Arc::new(pool))
    }
}
