//! Message channel between host tasks and a worker thread.
//!
//! Requests travel host → script through an unbounded [`RequestQueue`] of
//! serialized envelopes. Responses travel script → host through the
//! [`ResponseRouter`], which owns the table of pending correlation ids and
//! completes the matching awaiter.

use crate::error::{BridgeError, Result};
use crate::metrics::WorkerMetrics;
use crate::protocol::{CorrelationId, RequestKind, ResponseEnvelope, WorkerId, WorkerResult};
use crate::translate::{split_payload, EngineError, ErrorObject, FatalError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// What the awaiting host task eventually receives
pub type ResponseResult = Result<WorkerResult>;

/// Host side of the request queue
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl RequestQueue {
    /// Create a queue and the receiver the worker thread drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a serialized envelope. Never blocks.
    pub fn push(&self, raw: String) -> std::result::Result<(), String> {
        self.tx.send(raw).map_err(|e| e.0)
    }

    /// Whether the worker thread dropped its receiver
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct PendingRequest {
    kind: RequestKind,
    nodes_limit: usize,
    responder: oneshot::Sender<ResponseResult>,
}

/// What happened to a response handed to the router
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// An awaiter received it
    Delivered,
    /// Nobody was waiting for that id
    Orphaned,
    /// It had no id; this many awaiters were failed
    Broadcast(usize),
    /// The engine itself failed; nothing was delivered and the worker must stop
    Fatal(FatalError),
}

/// Pending table shared by the host and the worker thread
pub struct ResponseRouter {
    worker_id: WorkerId,
    nodes_limit: usize,
    pending: DashMap<CorrelationId, PendingRequest>,
    closed: AtomicBool,
    metrics: Arc<WorkerMetrics>,
}

impl ResponseRouter {
    /// Create a router for one worker
    pub fn new(worker_id: WorkerId, nodes_limit: usize, metrics: Arc<WorkerMetrics>) -> Self {
        Self {
            worker_id,
            nodes_limit,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Start awaiting a response for `id`.
    ///
    /// Fails once the router is closed, so an id registered after the worker
    /// died can never hang.
    pub fn register(
        &self,
        id: CorrelationId,
        kind: RequestKind,
        nodes_limit: Option<usize>,
    ) -> Result<oneshot::Receiver<ResponseResult>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.died("worker stopped accepting requests", Vec::new()));
        }
        let (responder, receiver) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::Protocol(format!(
                    "correlation id {id} is already awaiting a reply"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    kind,
                    nodes_limit: nodes_limit.unwrap_or(self.nodes_limit),
                    responder,
                });
            }
        }
        // close() may have drained the table between the check and the insert
        if self.closed.load(Ordering::SeqCst) && self.pending.remove(&id).is_some() {
            return Err(self.died("worker stopped accepting requests", Vec::new()));
        }
        Ok(receiver)
    }

    /// Stop awaiting `id`; a late response becomes an orphan
    pub fn forget(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Route one serialized response envelope
    pub fn route(&self, raw: &str) -> anyhow::Result<RouteOutcome> {
        let envelope: ResponseEnvelope = serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("undecodable response envelope: {e}"))?;

        let payload = match split_payload(envelope.payload) {
            Err(objects) if objects.iter().any(ErrorObject::is_fatal_engine_error) => {
                return Ok(self.engine_failure(envelope.id, objects));
            }
            payload => payload,
        };

        let Some(id) = envelope.id else {
            return self.broadcast(payload);
        };

        let Some((_, pending)) = self.pending.remove(&id) else {
            self.metrics.record_orphan();
            warn!(worker_id = %self.worker_id, correlation_id = %id, "discarding orphaned response");
            return Ok(RouteOutcome::Orphaned);
        };

        let result = match payload {
            Ok(payload) => WorkerResult::decode(&id, pending.kind, payload, pending.nodes_limit),
            Err(objects) => Err(BridgeError::Script(FatalError::from_objects(
                Some(id.clone()),
                objects,
                pending.nodes_limit,
            ))),
        };

        debug!(
            worker_id = %self.worker_id,
            correlation_id = %id,
            kind = %pending.kind,
            ok = result.is_ok(),
            "routing response"
        );

        if pending.responder.send(result).is_err() {
            self.metrics.record_orphan();
            warn!(worker_id = %self.worker_id, correlation_id = %id, "awaiter went away before the response arrived");
            return Ok(RouteOutcome::Orphaned);
        }
        Ok(RouteOutcome::Delivered)
    }

    fn broadcast(
        &self,
        payload: std::result::Result<serde_json::Value, Vec<ErrorObject>>,
    ) -> anyhow::Result<RouteOutcome> {
        let Err(objects) = payload else {
            anyhow::bail!("response without an id must carry errors");
        };
        let fatal = FatalError::from_objects(None, objects, self.nodes_limit);
        error!(worker_id = %self.worker_id, errors = %fatal, "script reported an unattributed failure");
        self.metrics.record_broadcast_failure();
        let failed = self.fail_all(&self.died("unattributed script failure", fatal.errors));
        Ok(RouteOutcome::Broadcast(failed))
    }

    // The pending entry stays registered; it fails with everything else
    // when the worker closes the router.
    fn engine_failure(&self, id: Option<CorrelationId>, objects: Vec<ErrorObject>) -> RouteOutcome {
        let nodes_limit = id
            .as_deref()
            .and_then(|id| self.pending.get(id).map(|pending| pending.nodes_limit))
            .unwrap_or(self.nodes_limit);
        let fatal = FatalError::from_objects(id, objects, nodes_limit);
        error!(
            worker_id = %self.worker_id,
            correlation_id = fatal.id.as_deref().unwrap_or("-"),
            errors = %fatal,
            "engine failure, worker can't continue"
        );
        RouteOutcome::Fatal(fatal)
    }

    /// Fail every pending awaiter with `err`; returns how many were failed
    pub fn fail_all(&self, err: &BridgeError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.responder.send(Err(err.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Refuse new registrations and fail everything pending
    pub fn close(&self, reason: &str) -> usize {
        self.close_with(reason, Vec::new())
    }

    /// Like [`close`](Self::close), handing `errors` to every failed awaiter
    pub fn close_with(&self, reason: &str, errors: Vec<EngineError>) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_all(&self.died(reason, errors))
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn died(&self, reason: &str, errors: Vec<EngineError>) -> BridgeError {
        BridgeError::WorkerDied {
            worker_id: self.worker_id.clone(),
            reason: reason.to_string(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> ResponseRouter {
        ResponseRouter::new("worker-1".into(), 20, Arc::new(WorkerMetrics::new()))
    }

    #[tokio::test]
    async fn test_delivers_success() {
        let router = router();
        let rx = router
            .register("a".into(), RequestKind::ApiSchema, None)
            .unwrap();
        let raw = json!({ "id": "a", "payload": { "schema": "type Query { a: Int }" } }).to_string();

        assert_eq!(router.route(&raw).unwrap(), RouteOutcome::Delivered);
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, WorkerResult::ApiSchema("type Query { a: Int }".into()));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_delivers_script_errors() {
        let router = router();
        let rx = router.register("b".into(), RequestKind::Plan, None).unwrap();
        let raw = json!({
            "id": "b",
            "payload": { "errors": [{ "name": "ProtocolError", "message": "no such session: 1" }] }
        })
        .to_string();

        router.route(&raw).unwrap();
        let err = rx.await.unwrap().unwrap_err();
        let BridgeError::Script(fatal) = err else {
            panic!("expected a script error");
        };
        assert_eq!(fatal.id.as_deref(), Some("b"));
        assert_eq!(fatal.errors[0].message(), "no such session: 1");
    }

    #[test]
    fn test_orphans_are_counted() {
        let metrics = Arc::new(WorkerMetrics::new());
        let router = ResponseRouter::new("w".into(), 20, metrics.clone());
        let raw = json!({ "id": "never-issued", "payload": { "signature": "x" } }).to_string();
        assert_eq!(router.route(&raw).unwrap(), RouteOutcome::Orphaned);

        let rx = router.register("late".into(), RequestKind::Signature, None).unwrap();
        assert!(router.forget("late"));
        drop(rx);
        let raw = json!({ "id": "late", "payload": { "signature": "x" } }).to_string();
        assert_eq!(router.route(&raw).unwrap(), RouteOutcome::Orphaned);
        assert_eq!(metrics.orphaned_responses(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_fails_every_awaiter() {
        let router = router();
        let first = router.register("1".into(), RequestKind::Plan, None).unwrap();
        let second = router.register("2".into(), RequestKind::Plan, None).unwrap();
        let raw = json!({
            "payload": { "errors": [{ "name": "SyntaxError", "message": "JSON.parse: unexpected token" }] }
        })
        .to_string();

        assert_eq!(router.route(&raw).unwrap(), RouteOutcome::Broadcast(2));
        for rx in [first, second] {
            match rx.await.unwrap() {
                Err(BridgeError::WorkerDied { errors, .. }) => {
                    assert_eq!(errors[0].message(), "JSON.parse: unexpected token");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(!router.is_closed());
    }

    #[test]
    fn test_broadcast_without_errors_is_rejected() {
        let router = router();
        let raw = json!({ "payload": { "schema": "x" } }).to_string();
        assert!(router.route(&raw).is_err());
        assert!(router.route("not json").is_err());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_refuses_new() {
        let router = router();
        let rx = router.register("p".into(), RequestKind::Introspect, None).unwrap();
        assert_eq!(router.close("event loop stopped"), 1);
        assert!(matches!(
            rx.await.unwrap(),
            Err(BridgeError::WorkerDied { ref reason, .. }) if reason == "event loop stopped"
        ));
        assert!(router
            .register("q".into(), RequestKind::Introspect, None)
            .is_err());
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let router = router();
        let _rx = router.register("dup".into(), RequestKind::Plan, None).unwrap();
        assert!(matches!(
            router.register("dup".into(), RequestKind::Plan, None),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_concurrent_registrations_of_one_id() {
        let router = router();
        let accepted: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| router.register("race".into(), RequestKind::Plan, None)))
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap().ok())
                .collect()
        });
        assert_eq!(accepted.len(), 1);
        assert_eq!(router.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_engine_failure_is_not_delivered() {
        let router = router();
        let rx = router.register("oom".into(), RequestKind::Plan, None).unwrap();
        let other = router.register("queued".into(), RequestKind::ApiSchema, None).unwrap();
        let raw = json!({
            "id": "oom",
            "payload": { "errors": [{ "name": "InternalError", "message": "out of memory" }] }
        })
        .to_string();

        let RouteOutcome::Fatal(fatal) = router.route(&raw).unwrap() else {
            panic!("expected an engine failure");
        };
        assert_eq!(fatal.id.as_deref(), Some("oom"));
        assert_eq!(router.pending_count(), 2);

        assert_eq!(router.close_with("out of memory", fatal.errors), 2);
        for rx in [rx, other] {
            match rx.await.unwrap() {
                Err(BridgeError::WorkerDied { errors, .. }) => {
                    assert_eq!(errors[0].message(), "out of memory");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_queue_push() {
        let (queue, mut rx) = RequestQueue::channel();
        queue.push("one".into()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "one");
        drop(rx);
        assert!(queue.is_closed());
        assert_eq!(queue.push("two".into()).unwrap_err(), "two");
    }
}
