//! Query planner sessions and one-shot composition.
//!
//! A [`Planner`] is a session on a worker (or a pool): creating it sends
//! `UpdateSchema` under a fresh schema id, its methods target that session,
//! and dropping it sends `Exit`.

use crate::engine::PlannerBackend;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    CompositionOutput, PlanOptions, PlanSuccess, QueryPlannerConfig, RequestKind,
    RequestPayload, SchemaId, SchemaSource, SubgraphDefinition, WorkerResult,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument};

static NEXT_SCHEMA_ID: AtomicU64 = AtomicU64::new(1);

fn next_schema_id() -> SchemaId {
    NEXT_SCHEMA_ID.fetch_add(1, Ordering::Relaxed)
}

fn unexpected(expected: RequestKind, got: &WorkerResult) -> BridgeError {
    BridgeError::Protocol(format!(
        "unexpected response kind: expected {expected}, got {}",
        got.kind()
    ))
}

/// A query planner bound to one schema
pub struct Planner {
    backend: PlannerBackend,
    schema_id: SchemaId,
    supergraph_sdl: String,
    config: QueryPlannerConfig,
}

impl Planner {
    /// Create a planner session for `schema`.
    ///
    /// Subgraph sources are composed first; composition and schema errors
    /// come back as validation errors.
    #[instrument(skip_all)]
    pub async fn new(
        backend: impl Into<PlannerBackend>,
        schema: SchemaSource,
        config: QueryPlannerConfig,
    ) -> Result<Self> {
        let backend = backend.into();
        let schema_id = next_schema_id();
        let result = backend
            .request(RequestPayload::UpdateSchema {
                schema,
                config: config.clone(),
                schema_id,
            })
            .await?;

        let WorkerResult::SchemaUpdated(updated) = result else {
            return Err(unexpected(RequestKind::UpdateSchema, &result));
        };
        debug!(schema_id, "planner session created");

        Ok(Self {
            backend,
            schema_id,
            supergraph_sdl: updated.supergraph_sdl,
            config,
        })
    }

    /// A new planner for `schema` on the same backend, keeping this one
    pub async fn update(&self, schema: SchemaSource, config: QueryPlannerConfig) -> Result<Self> {
        Self::new(self.backend.clone(), schema, config).await
    }

    /// Plan an operation
    #[instrument(skip(self, query, options), fields(schema_id = self.schema_id))]
    pub async fn plan(
        &self,
        query: impl Into<String>,
        operation_name: Option<String>,
        options: PlanOptions,
    ) -> Result<PlanSuccess> {
        let result = self
            .backend
            .request(RequestPayload::Plan {
                query: query.into(),
                operation_name,
                schema_id: self.schema_id,
                options,
            })
            .await?;
        match result {
            WorkerResult::Plan(plan) => Ok(plan),
            other => Err(unexpected(RequestKind::Plan, &other)),
        }
    }

    /// The API schema: the supergraph without federation internals
    pub async fn api_schema(&self) -> Result<String> {
        let result = self
            .backend
            .request(RequestPayload::ApiSchema {
                schema_id: self.schema_id,
            })
            .await?;
        match result {
            WorkerResult::ApiSchema(schema) => Ok(schema),
            other => Err(unexpected(RequestKind::ApiSchema, &other)),
        }
    }

    /// Run an introspection query; returns a GraphQL execution result
    pub async fn introspect(&self, query: impl Into<String>) -> Result<Value> {
        let result = self
            .backend
            .request(RequestPayload::Introspect {
                query: query.into(),
                schema_id: self.schema_id,
            })
            .await?;
        match result {
            WorkerResult::Introspection(execution_result) => Ok(execution_result),
            other => Err(unexpected(RequestKind::Introspect, &other)),
        }
    }

    /// Usage reporting signature of an operation
    pub async fn operation_signature(
        &self,
        query: impl Into<String>,
        operation_name: Option<String>,
    ) -> Result<String> {
        let result = self
            .backend
            .request(RequestPayload::Signature {
                query: query.into(),
                operation_name,
                schema_id: self.schema_id,
            })
            .await?;
        match result {
            WorkerResult::Signature(signature) => Ok(signature),
            other => Err(unexpected(RequestKind::Signature, &other)),
        }
    }

    /// Subgraph schemas extracted from the supergraph, by subgraph name
    pub async fn subgraphs(&self) -> Result<HashMap<String, String>> {
        let result = self
            .backend
            .request(RequestPayload::Subgraphs {
                schema_id: self.schema_id,
            })
            .await?;
        match result {
            WorkerResult::Subgraphs(subgraphs) => Ok(subgraphs),
            other => Err(unexpected(RequestKind::Subgraphs, &other)),
        }
    }

    /// Session id
    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    /// Supergraph SDL the session plans against
    pub fn supergraph_sdl(&self) -> &str {
        &self.supergraph_sdl
    }

    /// Planner configuration
    pub fn config(&self) -> &QueryPlannerConfig {
        &self.config
    }
}

impl Drop for Planner {
    fn drop(&mut self) {
        if let Err(err) = self.backend.exit_session(self.schema_id) {
            debug!(schema_id = self.schema_id, error = %err, "couldn't exit planner session");
        }
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("schema_id", &self.schema_id)
            .finish()
    }
}

/// Compose subgraphs into a supergraph
pub async fn compose(
    backend: impl Into<PlannerBackend>,
    subgraphs: Vec<SubgraphDefinition>,
) -> Result<CompositionOutput> {
    compose_request(backend.into(), subgraphs, None).await
}

/// Like [`compose`], capping error and hint nodes at `nodes_limit`
pub async fn compose_with_nodes_limit(
    backend: impl Into<PlannerBackend>,
    subgraphs: Vec<SubgraphDefinition>,
    nodes_limit: usize,
) -> Result<CompositionOutput> {
    compose_request(backend.into(), subgraphs, Some(nodes_limit)).await
}

async fn compose_request(
    backend: PlannerBackend,
    subgraphs: Vec<SubgraphDefinition>,
    nodes_limit: Option<usize>,
) -> Result<CompositionOutput> {
    let count = subgraphs.len();
    let result = backend
        .request(RequestPayload::Compose {
            subgraphs,
            nodes_limit,
        })
        .await?;
    match result {
        WorkerResult::Composition(output) => {
            debug!(subgraphs = count, hints = output.hints.len(), "composed supergraph");
            Ok(output)
        }
        other => Err(unexpected(RequestKind::Compose, &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::instance::WorkerState;
    use crate::engine::payload::{fixture, ScriptPayload};
    use crate::engine::pool::WorkerPool;
    use crate::engine::test_support::{worker, SUPERGRAPH};
    use crate::engine::Worker;
    use crate::error::ErrorCode;
    use crate::translate::EngineError;
    use std::sync::Arc;

    const ACCOUNTS: &str = r#"
        type Query { me: User }
        type User @key(fields: "id") { id: ID! name: String }
    "#;

    async fn planner(worker: &Arc<Worker>) -> Planner {
        Planner::new(
            Arc::clone(worker),
            SchemaSource::supergraph(SUPERGRAPH),
            QueryPlannerConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_planner_operations() {
        let worker = Arc::new(worker().await);
        let planner = planner(&worker).await;
        assert!(planner.supergraph_sdl().contains("join__Graph"));

        let plan = planner
            .plan("{ hello }", None, PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.query_plan["node"]["kind"], "Fetch");

        let api = planner.api_schema().await.unwrap();
        assert!(api.contains("type Query {"));
        assert!(!api.contains("join__"));

        let introspection = planner
            .introspect("{ __schema { queryType { name } } }")
            .await
            .unwrap();
        assert_eq!(
            introspection["data"]["__schema"]["queryType"]["name"],
            "Query"
        );

        let signature = planner
            .operation_signature("query Me { me { name } hello }", Some("Me".into()))
            .await
            .unwrap();
        assert_eq!(signature, "# Me\nquery Me{hello me{name}}");

        let subgraphs = planner.subgraphs().await.unwrap();
        assert_eq!(subgraphs.len(), 2);
        assert!(subgraphs["accounts"].contains("me: User"));
        assert!(subgraphs["products"].contains("topProducts"));
    }

    #[tokio::test]
    async fn test_parallel_plan_across_subgraphs() {
        let worker = Arc::new(worker().await);
        let planner = planner(&worker).await;
        let plan = planner
            .plan("{ hello topProducts { upc } }", None, PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.query_plan["node"]["kind"], "Parallel");
        assert_eq!(plan.query_plan["node"]["nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_planners_get_distinct_sessions() {
        let worker = Arc::new(worker().await);
        let first = planner(&worker).await;
        let second = planner(&worker).await;
        assert_ne!(first.schema_id(), second.schema_id());

        drop(first);
        second
            .plan("{ hello }", None, PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        drop(second);
        worker.terminated().await;
    }

    #[tokio::test]
    async fn test_planner_from_subgraphs() {
        let worker = Arc::new(worker().await);
        let planner = Planner::new(
            Arc::clone(&worker),
            SchemaSource::subgraphs(vec![
                SubgraphDefinition::new("accounts", "http://accounts", ACCOUNTS),
                SubgraphDefinition::new(
                    "products",
                    "http://products",
                    "type Query { topProducts: [String] }",
                ),
            ]),
            QueryPlannerConfig::default(),
        )
        .await
        .unwrap();

        let plan = planner
            .plan("{ topProducts }", None, PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.query_plan["node"]["serviceName"], "products");

        let updated = planner
            .update(SchemaSource::supergraph(SUPERGRAPH), QueryPlannerConfig::default())
            .await
            .unwrap();
        assert_ne!(updated.schema_id(), planner.schema_id());
        updated
            .plan("{ hello }", None, PlanOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_supergraph() {
        let worker = Arc::new(worker().await);
        let err = Planner::new(
            Arc::clone(&worker),
            SchemaSource::supergraph("type Query { hello: String }"),
            QueryPlannerConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(err.is_validation());
        let EngineError::GraphQL(error) = &err.engine_errors()[0] else {
            panic!("expected a GraphQL error");
        };
        assert_eq!(error.code(), Some("INVALID_SUPERGRAPH"));
        assert_eq!(err.user_message(), "Invalid supergraph: missing join__Graph enum");
    }

    #[tokio::test]
    async fn test_compose_reports_hints() {
        let worker = Arc::new(worker().await);
        let output = compose(
            Arc::clone(&worker),
            vec![
                SubgraphDefinition::new("accounts", "http://accounts", ACCOUNTS),
                SubgraphDefinition::new(
                    "reviews",
                    "http://reviews",
                    r#"
                    type Query { reviews: [String] }
                    type User @key(fields: "id") { id: ID! }
                    "#,
                ),
            ],
        )
        .await
        .unwrap();

        assert!(output.supergraph_sdl.contains("@join__type(graph: REVIEWS, key: \"id\")"));
        assert!(output
            .hints
            .iter()
            .any(|hint| hint.code.as_deref() == Some("INCONSISTENT_OBJECT_VALUE_TYPE_FIELD")));
    }

    #[tokio::test]
    async fn test_compose_conflict_names_both_subgraphs() {
        let worker = Arc::new(worker().await);
        let subgraphs = vec![
            SubgraphDefinition::new("accounts", "http://accounts", ACCOUNTS),
            SubgraphDefinition::new(
                "reviews",
                "http://reviews",
                r#"
                type Query { top: [User] }
                type User @key(fields: "id") { id: ID! name: String }
                "#,
            ),
        ];

        let err = compose(Arc::clone(&worker), subgraphs.clone())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.code(), ErrorCode::Validation);
        let EngineError::GraphQL(error) = &err.engine_errors()[0] else {
            panic!("expected a GraphQL error");
        };
        assert!(error.message.contains("\"accounts\" and \"reviews\""));
        assert_eq!(error.code(), Some("INVALID_FIELD_SHARING"));
        assert_eq!(error.nodes.len(), 2);
        assert_eq!(error.omitted_nodes_count, None);

        let err = compose_with_nodes_limit(Arc::clone(&worker), subgraphs, 1)
            .await
            .unwrap_err();
        let EngineError::GraphQL(error) = &err.engine_errors()[0] else {
            panic!("expected a GraphQL error");
        };
        assert_eq!(error.nodes.len(), 1);
        assert_eq!(error.omitted_nodes_count, Some(1));
    }

    #[tokio::test]
    async fn test_nodes_limit_reaches_the_library() {
        let library = r#"
            globalThis.federation = {
              compose: (subgraphs, nodesLimit) => ({
                errors: [{
                  name: "GraphQLError",
                  message: "seen limit=" + nodesLimit,
                  nodes: Array.from({ length: 50 }, (_, i) => ({ i })),
                }],
              }),
            };
        "#;
        let worker = Arc::new(
            Worker::spawn(
                ScriptPayload::with_library("echo.js", library),
                BridgeConfig::default(),
            )
            .await
            .unwrap(),
        );
        let subgraphs = vec![SubgraphDefinition::new("accounts", "http://accounts", ACCOUNTS)];

        let err = compose_with_nodes_limit(Arc::clone(&worker), subgraphs.clone(), 3)
            .await
            .unwrap_err();
        let EngineError::GraphQL(error) = &err.engine_errors()[0] else {
            panic!("expected a GraphQL error");
        };
        assert_eq!(error.message, "seen limit=3");
        assert_eq!(error.nodes.len(), 3);
        assert_eq!(error.omitted_nodes_count, Some(47));

        let err = compose(Arc::clone(&worker), subgraphs).await.unwrap_err();
        let EngineError::GraphQL(error) = &err.engine_errors()[0] else {
            panic!("expected a GraphQL error");
        };
        let limit = BridgeConfig::default().nodes_limit;
        assert_eq!(error.message, format!("seen limit={limit}"));
        assert_eq!(error.nodes.len(), limit);
    }

    #[tokio::test]
    async fn test_planner_on_pool() {
        let config = BridgeConfig::default().with_pool_size(2);
        let pool = Arc::new(WorkerPool::new(fixture(), config).await.unwrap());

        let planner = Planner::new(
            Arc::clone(&pool),
            SchemaSource::supergraph(SUPERGRAPH),
            QueryPlannerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(pool.session_count(), 1);
        planner
            .plan("{ me { name } }", None, PlanOptions::default())
            .await
            .unwrap();

        drop(planner);
        assert_eq!(pool.session_count(), 0);

        let output = compose(
            Arc::clone(&pool),
            vec![SubgraphDefinition::new("accounts", "", ACCOUNTS)],
        )
        .await
        .unwrap();
        assert!(output.hints.is_empty());
    }
}
