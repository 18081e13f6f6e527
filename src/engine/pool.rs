//! Worker pool with session affinity.
//!
//! Sessions are pinned to the worker that created them: every request for a
//! schema id goes to the worker that answered its `UpdateSchema`. New
//! sessions and sessionless requests are placed by picking two random
//! workers and taking the one with fewer requests in flight. Workers that
//! terminated (for instance after their last session exited) are respawned
//! on the next request that needs them.

use super::instance::WorkerState;
use super::payload::ScriptPayload;
use super::{no_reply_guard, Worker};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::metrics::WorkerMetrics;
use crate::protocol::{HeapStatistics, RequestKind, RequestPayload, SchemaId, WorkerId, WorkerResult};
use crate::translate::{ErrorObject, FatalError, PROTOCOL_ERROR_NAME};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Worker a session lives on
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placement {
    index: usize,
    worker_id: WorkerId,
}

struct Slot {
    worker: RwLock<Arc<Worker>>,
    respawn: tokio::sync::Mutex<()>,
}

impl Slot {
    fn current(&self) -> Arc<Worker> {
        self.worker.read().clone()
    }
}

/// Fixed-size set of workers sharing one payload
pub struct WorkerPool {
    slots: Vec<Slot>,
    sessions: DashMap<SchemaId, Placement>,
    placement: Mutex<()>,
    payload: Arc<ScriptPayload>,
    config: BridgeConfig,
    metrics: Arc<WorkerMetrics>,
    shutdown: AtomicBool,
}

impl WorkerPool {
    /// Start `config.pool_size` workers
    pub async fn new(payload: impl Into<Arc<ScriptPayload>>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let payload = payload.into();
        let metrics = Arc::new(WorkerMetrics::new());

        info!(
            pool_size = config.pool_size,
            max_sessions_per_worker = config.max_sessions_per_worker,
            fingerprint = payload.short_fingerprint(),
            "creating worker pool"
        );

        let mut slots = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let worker = Worker::spawn_with_metrics(
                Arc::clone(&payload),
                config.clone(),
                Arc::clone(&metrics),
            )
            .await?;
            slots.push(Slot {
                worker: RwLock::new(Arc::new(worker)),
                respawn: tokio::sync::Mutex::new(()),
            });
        }

        Ok(Self {
            slots,
            sessions: DashMap::new(),
            placement: Mutex::new(()),
            payload,
            config,
            metrics,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Route a request and wait for its reply
    pub async fn request(&self, payload: RequestPayload) -> Result<WorkerResult> {
        self.ensure_open()?;
        no_reply_guard(&payload)?;

        match payload.schema_id() {
            Some(schema_id) if payload.kind() == RequestKind::UpdateSchema => {
                self.update_schema(schema_id, payload).await
            }
            Some(schema_id) => {
                let worker = self.session_worker(schema_id)?;
                worker.request(payload).await
            }
            None => self.sessionless(payload).await,
        }
    }

    async fn update_schema(
        &self,
        schema_id: SchemaId,
        payload: RequestPayload,
    ) -> Result<WorkerResult> {
        let mut retried = false;
        loop {
            self.revive().await?;

            let (placement, fresh) = {
                let _guard = self.placement.lock();
                match self.valid_placement(schema_id) {
                    Some(placement) => (placement, false),
                    None => (self.place(schema_id)?, true),
                }
            };
            let worker = self.slots[placement.index].current();

            let result = worker.request(payload.clone()).await;
            let Err(err) = &result else {
                debug!(schema_id, worker_id = %placement.worker_id, fresh, "session updated");
                return result;
            };
            if !fresh || matches!(err, BridgeError::Timeout { .. }) {
                return result;
            }

            self.sessions
                .remove_if(&schema_id, |_, existing| *existing == placement);
            // The worker may have left its loop after its last session exited
            let stopped = matches!(
                err,
                BridgeError::NotRunning { .. } | BridgeError::WorkerDied { .. }
            );
            if !stopped || retried {
                return result;
            }
            retried = true;
            debug!(schema_id, worker_id = %placement.worker_id, "placement hit a stopping worker, retrying");
        }
    }

    async fn sessionless(&self, payload: RequestPayload) -> Result<WorkerResult> {
        let mut retried = false;
        loop {
            self.revive().await?;
            let index = self.pick(|_| true).ok_or_else(|| {
                BridgeError::PoolExhausted("the pool has no workers".into())
            })?;
            let result = self.slots[index].current().request(payload.clone()).await;
            if retried || !matches!(result, Err(BridgeError::NotRunning { .. })) {
                return result;
            }
            retried = true;
        }
    }

    /// Send `payload` to every worker, then wait for every reply
    pub async fn broadcast_request(&self, payload: RequestPayload) -> Vec<Result<WorkerResult>> {
        if let Err(err) = self.ensure_open().and_then(|_| no_reply_guard(&payload)) {
            return vec![Err(err)];
        }
        if let Err(err) = self.revive().await {
            return vec![Err(err)];
        }

        let workers = self.workers();
        let sent: Vec<_> = workers
            .iter()
            .map(|worker| worker.send(payload.clone()))
            .collect();

        let mut results = Vec::with_capacity(workers.len());
        for (worker, sent) in workers.iter().zip(sent) {
            results.push(match sent {
                Ok(pending) => worker.await_response(pending).await,
                Err(err) => Err(err),
            });
        }
        results
    }

    /// Heap statistics of every worker
    pub async fn heap_statistics(&self) -> Result<Vec<HeapStatistics>> {
        self.broadcast_request(RequestPayload::GetHeapStatistics)
            .await
            .into_iter()
            .map(|result| match result? {
                WorkerResult::HeapStatistics(stats) => Ok(stats),
                other => Err(BridgeError::Protocol(format!(
                    "expected heap statistics, got a {} response",
                    other.kind()
                ))),
            })
            .collect()
    }

    /// Drop a session. Unknown ids are ignored.
    pub fn exit_session(&self, schema_id: SchemaId) -> Result<()> {
        let Some((_, placement)) = self.sessions.remove(&schema_id) else {
            return Ok(());
        };
        let worker = self.slots[placement.index].current();
        if worker.id() != placement.worker_id {
            return Ok(());
        }
        match worker.exit_session(schema_id) {
            Err(BridgeError::NotRunning { .. }) => Ok(()),
            other => other,
        }
    }

    /// Stop every worker
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(pool_size = self.slots.len(), "shutting down worker pool");
        self.sessions.clear();
        for worker in self.workers() {
            if let Err(err) = worker.shutdown().await {
                warn!(worker_id = %worker.id(), error = %err, "worker did not shut down cleanly");
            }
        }
        Ok(())
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Sessions currently placed
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Worker holding a session
    pub fn session_worker_id(&self, schema_id: SchemaId) -> Option<WorkerId> {
        self.sessions
            .get(&schema_id)
            .map(|placement| placement.worker_id.clone())
    }

    /// State of every worker, in slot order
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers().iter().map(|worker| worker.state()).collect()
    }

    /// Metrics shared by every worker of the pool
    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.slots.iter().map(Slot::current).collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(BridgeError::PoolExhausted("the pool was shut down".into()))
        } else {
            Ok(())
        }
    }

    fn session_worker(&self, schema_id: SchemaId) -> Result<Arc<Worker>> {
        let placement = self
            .sessions
            .get(&schema_id)
            .map(|placement| placement.clone())
            .ok_or_else(|| self.no_such_session(schema_id))?;

        let worker = self.slots[placement.index].current();
        if worker.id() != placement.worker_id || worker.state() != WorkerState::Running {
            self.sessions
                .remove_if(&schema_id, |_, existing| *existing == placement);
            warn!(schema_id, worker_id = %placement.worker_id, "session was lost with its worker");
            return Err(self.no_such_session(schema_id));
        }
        Ok(worker)
    }

    fn no_such_session(&self, schema_id: SchemaId) -> BridgeError {
        BridgeError::Script(FatalError::from_objects(
            None,
            vec![ErrorObject::new(
                PROTOCOL_ERROR_NAME,
                format!("no such session: {schema_id}"),
            )],
            self.config.nodes_limit,
        ))
    }

    fn valid_placement(&self, schema_id: SchemaId) -> Option<Placement> {
        let placement = self.sessions.get(&schema_id)?.clone();
        let worker = self.slots[placement.index].current();
        (worker.id() == placement.worker_id).then_some(placement)
    }

    fn sessions_on(&self, index: usize, worker_id: &str) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.index == index && entry.worker_id == worker_id)
            .count()
    }

    // Caller holds the placement lock
    fn place(&self, schema_id: SchemaId) -> Result<Placement> {
        let max = self.config.max_sessions_per_worker;
        let index = self
            .pick(|index| {
                let worker = self.slots[index].current();
                worker.state() == WorkerState::Running && self.sessions_on(index, worker.id()) < max
            })
            .ok_or_else(|| {
                BridgeError::PoolExhausted(format!(
                    "all {} workers already hold {max} sessions",
                    self.slots.len()
                ))
            })?;

        let placement = Placement {
            index,
            worker_id: self.slots[index].current().id().to_string(),
        };
        self.sessions.insert(schema_id, placement.clone());
        Ok(placement)
    }

    /// Two random choices among eligible slots, least pending requests wins
    fn pick(&self, eligible: impl Fn(usize) -> bool) -> Option<usize> {
        let candidates: Vec<usize> = (0..self.slots.len()).filter(|&i| eligible(i)).collect();
        let mut rng = rand::thread_rng();
        let choices: Vec<usize> = candidates.choose_multiple(&mut rng, 2).copied().collect();
        choices
            .into_iter()
            .min_by_key(|&index| self.slots[index].current().pending_requests())
    }

    /// Respawn every worker that stopped or is stopping
    async fn revive(&self) -> Result<()> {
        for index in 0..self.slots.len() {
            let worker = self.slots[index].current();
            match worker.state() {
                WorkerState::Draining => {
                    worker.terminated().await;
                    self.respawn(index, &worker).await?;
                }
                WorkerState::Terminated => self.respawn(index, &worker).await?,
                WorkerState::Uninitialized | WorkerState::Running => {}
            }
        }
        Ok(())
    }

    async fn respawn(&self, index: usize, dead: &Arc<Worker>) -> Result<()> {
        let slot = &self.slots[index];
        let _guard = slot.respawn.lock().await;
        if !Arc::ptr_eq(&slot.current(), dead) {
            return Ok(());
        }
        self.ensure_open()?;

        let dead_id = dead.id().to_string();
        self.sessions
            .retain(|_, placement| placement.worker_id != dead_id);

        let worker = Worker::spawn_with_metrics(
            Arc::clone(&self.payload),
            self.config.clone(),
            Arc::clone(&self.metrics),
        )
        .await?;
        info!(slot = index, old = %dead_id, new = %worker.id(), "respawned worker");
        *slot.worker.write() = Arc::new(worker);
        Ok(())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.slots.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
