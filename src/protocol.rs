//! Wire types exchanged with the worker script.
//!
//! Requests are `{ "id": ..., "payload": { "kind": ..., ... } }` envelopes with
//! camelCase fields. Success payloads are decoded per request kind into a
//! [`WorkerResult`]; error payloads are handled by [`crate::translate`].

use crate::error::{BridgeError, Result};
use crate::translate::truncate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Correlation id pairing a request with its response (UUID v4)
pub type CorrelationId = String;

/// Host-chosen identifier of a schema session
pub type SchemaId = u64;

/// Largest schema id the script can hold without losing precision (2^53 - 1)
pub const MAX_SCHEMA_ID: SchemaId = (1 << 53) - 1;

/// Unique worker identifier (UUID v4)
pub type WorkerId = String;

/// Where the schema of a session comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaSource {
    /// An already composed supergraph
    #[serde(rename_all = "camelCase")]
    Supergraph {
        /// Supergraph SDL
        supergraph_sdl: String,
    },
    /// Subgraphs to compose before planning
    Subgraphs {
        /// Subgraph definitions
        subgraphs: Vec<SubgraphDefinition>,
    },
}

impl SchemaSource {
    /// A composed supergraph
    pub fn supergraph(sdl: impl Into<String>) -> Self {
        SchemaSource::Supergraph {
            supergraph_sdl: sdl.into(),
        }
    }

    /// Subgraphs to compose
    pub fn subgraphs(subgraphs: Vec<SubgraphDefinition>) -> Self {
        SchemaSource::Subgraphs { subgraphs }
    }
}

/// Everything needed to know about a subgraph for composition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphDefinition {
    /// Name used in the supergraph and in query plans
    pub name: String,

    /// Routing URL of the subgraph
    #[serde(default)]
    pub url: String,

    /// Type definitions of the subgraph
    pub sdl: String,
}

impl SubgraphDefinition {
    /// Create a subgraph definition
    pub fn new(name: impl Into<String>, url: impl Into<String>, sdl: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            sdl: sdl.into(),
        }
    }
}

/// Planner options forwarded verbatim to the library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlannerConfig {
    /// `@defer`/`@stream` support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_delivery: Option<IncrementalDeliverySupport>,

    /// Validate operations before planning (default: true)
    #[serde(default = "default_true")]
    pub graphql_validation: bool,

    /// Reuse fragments from the original operation in subgraph fetches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reuse_query_fragments: Option<bool>,

    /// Generate fragments for repeated selections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_query_fragments: Option<bool>,

    /// Planner debug limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<QueryPlannerDebugConfig>,
}

impl Default for QueryPlannerConfig {
    fn default() -> Self {
        Self {
            incremental_delivery: None,
            graphql_validation: true,
            reuse_query_fragments: None,
            generate_query_fragments: None,
            debug: None,
        }
    }
}

/// Incremental delivery switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalDeliverySupport {
    /// Enable `@defer`
    #[serde(default)]
    pub enable_defer: Option<bool>,
}

/// Limits that bound planner work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlannerDebugConfig {
    /// Skip planning when the supergraph has a single subgraph
    #[serde(default)]
    pub bypass_planner_for_single_subgraph: Option<bool>,
    /// Upper bound on evaluated plans
    #[serde(default)]
    pub max_evaluated_plans: Option<u32>,
    /// Upper bound on explored paths
    #[serde(default)]
    pub paths_limit: Option<u32>,
}

/// Per-request planning options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOptions {
    /// Progressive override labels that are enabled for this request
    #[serde(default)]
    pub override_conditions: Vec<String>,
}

/// Request payload, tagged on `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RequestPayload {
    /// Create or replace a session
    #[serde(rename_all = "camelCase")]
    UpdateSchema {
        /// Schema of the session
        schema: SchemaSource,
        /// Planner configuration
        config: QueryPlannerConfig,
        /// Session id
        schema_id: SchemaId,
    },
    /// Plan an operation
    #[serde(rename_all = "camelCase")]
    Plan {
        /// Operation document
        query: String,
        /// Operation to plan when the document has several
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_name: Option<String>,
        /// Session id
        schema_id: SchemaId,
        /// Planning options
        #[serde(default)]
        options: PlanOptions,
    },
    /// Print the API schema of a session
    #[serde(rename_all = "camelCase")]
    ApiSchema {
        /// Session id
        schema_id: SchemaId,
    },
    /// Run an introspection query
    #[serde(rename_all = "camelCase")]
    Introspect {
        /// Introspection document
        query: String,
        /// Session id
        schema_id: SchemaId,
    },
    /// Compute the usage-reporting signature of an operation
    #[serde(rename_all = "camelCase")]
    Signature {
        /// Operation document
        query: String,
        /// Operation to sign when the document has several
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_name: Option<String>,
        /// Session id
        schema_id: SchemaId,
    },
    /// Extract the subgraph schemas of a session
    #[serde(rename_all = "camelCase")]
    Subgraphs {
        /// Session id
        schema_id: SchemaId,
    },
    /// Drop one session, or every session when no id is given. No reply.
    #[serde(rename_all = "camelCase")]
    Exit {
        /// Session id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_id: Option<SchemaId>,
    },
    /// Report engine heap usage
    GetHeapStatistics,
    /// Compose subgraphs without creating a session
    #[serde(rename_all = "camelCase")]
    Compose {
        /// Subgraphs to compose
        subgraphs: Vec<SubgraphDefinition>,
        /// Override of the configured nodes cap for this request
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nodes_limit: Option<usize>,
    },
}

impl RequestPayload {
    /// Kind tag of this payload
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::UpdateSchema { .. } => RequestKind::UpdateSchema,
            RequestPayload::Plan { .. } => RequestKind::Plan,
            RequestPayload::ApiSchema { .. } => RequestKind::ApiSchema,
            RequestPayload::Introspect { .. } => RequestKind::Introspect,
            RequestPayload::Signature { .. } => RequestKind::Signature,
            RequestPayload::Subgraphs { .. } => RequestKind::Subgraphs,
            RequestPayload::Exit { .. } => RequestKind::Exit,
            RequestPayload::GetHeapStatistics => RequestKind::GetHeapStatistics,
            RequestPayload::Compose { .. } => RequestKind::Compose,
        }
    }

    /// Session this payload targets, if any
    pub fn schema_id(&self) -> Option<SchemaId> {
        match self {
            RequestPayload::UpdateSchema { schema_id, .. }
            | RequestPayload::Plan { schema_id, .. }
            | RequestPayload::ApiSchema { schema_id }
            | RequestPayload::Introspect { schema_id, .. }
            | RequestPayload::Signature { schema_id, .. }
            | RequestPayload::Subgraphs { schema_id } => Some(*schema_id),
            RequestPayload::Exit { schema_id } => *schema_id,
            RequestPayload::GetHeapStatistics | RequestPayload::Compose { .. } => None,
        }
    }

    /// Per-request override of the nodes cap
    pub fn nodes_limit(&self) -> Option<usize> {
        match self {
            RequestPayload::Compose { nodes_limit, .. } => *nodes_limit,
            _ => None,
        }
    }
}

/// Discriminant of [`RequestPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// See [`RequestPayload::UpdateSchema`]
    UpdateSchema,
    /// See [`RequestPayload::Plan`]
    Plan,
    /// See [`RequestPayload::ApiSchema`]
    ApiSchema,
    /// See [`RequestPayload::Introspect`]
    Introspect,
    /// See [`RequestPayload::Signature`]
    Signature,
    /// See [`RequestPayload::Subgraphs`]
    Subgraphs,
    /// See [`RequestPayload::Exit`]
    Exit,
    /// See [`RequestPayload::GetHeapStatistics`]
    GetHeapStatistics,
    /// See [`RequestPayload::Compose`]
    Compose,
}

impl RequestKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::UpdateSchema => "UpdateSchema",
            RequestKind::Plan => "Plan",
            RequestKind::ApiSchema => "ApiSchema",
            RequestKind::Introspect => "Introspect",
            RequestKind::Signature => "Signature",
            RequestKind::Subgraphs => "Subgraphs",
            RequestKind::Exit => "Exit",
            RequestKind::GetHeapStatistics => "GetHeapStatistics",
            RequestKind::Compose => "Compose",
        }
    }

    /// Whether the script answers this kind
    pub fn expects_reply(&self) -> bool {
        !matches!(self, RequestKind::Exit)
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope sent to the script
#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    /// Correlation id, absent for fire-and-forget requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a str>,
    /// Cap on `nodes` and `locations` in the errors of the reply
    #[serde(rename = "nodesLimit")]
    pub nodes_limit: usize,
    /// Request body
    pub payload: &'a RequestPayload,
}

/// Envelope received from the script
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation id; absent for failures that can't be attributed
    #[serde(default)]
    pub id: Option<CorrelationId>,
    /// Success object or `{ errors }`
    #[serde(default)]
    pub payload: Value,
}

/// Heap usage of an engine runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapStatistics {
    /// Bytes allocated by the engine allocator
    pub heap_total: u64,
    /// Bytes in use by live objects
    pub heap_used: u64,
    /// Bytes held by compiled bytecode and other non-heap objects
    pub external: u64,
}

/// Answer to an `UpdateSchema` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaUpdated {
    /// Session that was created
    pub schema_id: SchemaId,
    /// Supergraph the session plans against
    pub supergraph_sdl: String,
}

/// Fields of one type referenced by an operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencedFieldsForType {
    /// Names of the referenced fields
    #[serde(default)]
    pub field_names: Vec<String>,
    /// Whether the type is an interface
    #[serde(default)]
    pub is_interface: bool,
}

/// Usage reporting data of a planned operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReporting {
    /// Normalized operation signature used as the stats key
    pub stats_report_key: String,
    /// Referenced fields grouped by type
    #[serde(default)]
    pub referenced_fields_by_type: HashMap<String, ReferencedFieldsForType>,
}

/// Answer to a `Plan` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSuccess {
    /// Plan tree as produced by the library
    pub query_plan: Value,
    /// Human readable plan
    #[serde(default)]
    pub formatted_query_plan: Option<String>,
    /// Usage reporting data
    #[serde(default)]
    pub usage_reporting: UsageReporting,
}

/// Composition hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionHint {
    /// Hint text
    pub message: String,
    /// Hint code
    #[serde(default)]
    pub code: Option<String>,
    /// Nodes the hint refers to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Value>,
    /// Nodes dropped by truncation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omitted_nodes_count: Option<u32>,
}

/// Answer to a `Compose` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionOutput {
    /// Composed supergraph
    pub supergraph_sdl: String,
    /// Hints raised during composition
    #[serde(default)]
    pub hints: Vec<CompositionHint>,
}

/// Typed success payload of a response
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResult {
    /// `UpdateSchema`
    SchemaUpdated(SchemaUpdated),
    /// `Plan`
    Plan(PlanSuccess),
    /// `ApiSchema`
    ApiSchema(String),
    /// `Introspect`: a GraphQL execution result
    Introspection(Value),
    /// `Signature`
    Signature(String),
    /// `Subgraphs`: subgraph name to SDL
    Subgraphs(HashMap<String, String>),
    /// `GetHeapStatistics`
    HeapStatistics(HeapStatistics),
    /// `Compose`
    Composition(CompositionOutput),
}

#[derive(Deserialize)]
struct ApiSchemaPayload {
    schema: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectPayload {
    execution_result: Value,
}

#[derive(Deserialize)]
struct SignaturePayload {
    signature: String,
}

#[derive(Deserialize)]
struct SubgraphsPayload {
    subgraphs: HashMap<String, String>,
}

impl WorkerResult {
    /// Decode the success payload of a `kind` request.
    pub fn decode(
        id: &str,
        kind: RequestKind,
        payload: Value,
        nodes_limit: usize,
    ) -> Result<Self> {
        let undecodable = |e: serde_json::Error| BridgeError::Deserialization {
            id: id.to_string(),
            message: format!("{kind}: {e}"),
        };
        let result = match kind {
            RequestKind::UpdateSchema => {
                WorkerResult::SchemaUpdated(serde_json::from_value(payload).map_err(undecodable)?)
            }
            RequestKind::Plan => {
                WorkerResult::Plan(serde_json::from_value(payload).map_err(undecodable)?)
            }
            RequestKind::ApiSchema => {
                let decoded: ApiSchemaPayload =
                    serde_json::from_value(payload).map_err(undecodable)?;
                WorkerResult::ApiSchema(decoded.schema)
            }
            RequestKind::Introspect => {
                let decoded: IntrospectPayload =
                    serde_json::from_value(payload).map_err(undecodable)?;
                WorkerResult::Introspection(decoded.execution_result)
            }
            RequestKind::Signature => {
                let decoded: SignaturePayload =
                    serde_json::from_value(payload).map_err(undecodable)?;
                WorkerResult::Signature(decoded.signature)
            }
            RequestKind::Subgraphs => {
                let decoded: SubgraphsPayload =
                    serde_json::from_value(payload).map_err(undecodable)?;
                WorkerResult::Subgraphs(decoded.subgraphs)
            }
            RequestKind::GetHeapStatistics => {
                WorkerResult::HeapStatistics(serde_json::from_value(payload).map_err(undecodable)?)
            }
            RequestKind::Compose => {
                let mut output: CompositionOutput =
                    serde_json::from_value(payload).map_err(undecodable)?;
                for hint in &mut output.hints {
                    if let Some(omitted) = truncate(&mut hint.nodes, nodes_limit) {
                        *hint.omitted_nodes_count.get_or_insert(0) += omitted;
                    }
                }
                WorkerResult::Composition(output)
            }
            RequestKind::Exit => {
                return Err(BridgeError::Protocol(format!(
                    "response {id} answers an Exit request, which expects no reply"
                )))
            }
        };
        Ok(result)
    }

    /// Kind of request this result answers
    pub fn kind(&self) -> RequestKind {
        match self {
            WorkerResult::SchemaUpdated(_) => RequestKind::UpdateSchema,
            WorkerResult::Plan(_) => RequestKind::Plan,
            WorkerResult::ApiSchema(_) => RequestKind::ApiSchema,
            WorkerResult::Introspection(_) => RequestKind::Introspect,
            WorkerResult::Signature(_) => RequestKind::Signature,
            WorkerResult::Subgraphs(_) => RequestKind::Subgraphs,
            WorkerResult::HeapStatistics(_) => RequestKind::GetHeapStatistics,
            WorkerResult::Composition(_) => RequestKind::Compose,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_request_wire_shape() {
        let payload = RequestPayload::Plan {
            query: "{ hello }".into(),
            operation_name: None,
            schema_id: 7,
            options: PlanOptions::default(),
        };
        let envelope = RequestEnvelope {
            id: Some("abc"),
            nodes_limit: 5,
            payload: &payload,
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "abc",
                "nodesLimit": 5,
                "payload": {
                    "kind": "Plan",
                    "query": "{ hello }",
                    "schemaId": 7,
                    "options": { "overrideConditions": [] }
                }
            })
        );
    }

    #[test]
    fn test_update_schema_wire_shape() {
        let payload = RequestPayload::UpdateSchema {
            schema: SchemaSource::subgraphs(vec![SubgraphDefinition::new(
                "a",
                "http://a",
                "type Query { a: Int }",
            )]),
            config: QueryPlannerConfig::default(),
            schema_id: 1,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "UpdateSchema");
        assert_eq!(value["schemaId"], 1);
        assert_eq!(value["schema"]["subgraphs"][0]["name"], "a");
        assert_eq!(value["config"]["graphqlValidation"], true);

        let supergraph = serde_json::to_value(SchemaSource::supergraph("schema {}")).unwrap();
        assert_eq!(supergraph, json!({ "supergraphSdl": "schema {}" }));
    }

    #[test]
    fn test_exit_and_heap_statistics_shapes() {
        let global = serde_json::to_value(RequestPayload::Exit { schema_id: None }).unwrap();
        assert_eq!(global, json!({ "kind": "Exit" }));

        let one = serde_json::to_value(RequestPayload::Exit { schema_id: Some(3) }).unwrap();
        assert_eq!(one, json!({ "kind": "Exit", "schemaId": 3 }));

        let heap = serde_json::to_value(RequestPayload::GetHeapStatistics).unwrap();
        assert_eq!(heap, json!({ "kind": "GetHeapStatistics" }));
        assert!(!RequestKind::Exit.expects_reply());
        assert!(RequestKind::GetHeapStatistics.expects_reply());
    }

    #[test]
    fn test_schema_id_lookup() {
        let plan = RequestPayload::Subgraphs { schema_id: 9 };
        assert_eq!(plan.schema_id(), Some(9));
        assert_eq!(plan.kind(), RequestKind::Subgraphs);
        assert_eq!(RequestPayload::GetHeapStatistics.schema_id(), None);
        assert_eq!(RequestPayload::Exit { schema_id: None }.schema_id(), None);
    }

    #[test]
    fn test_decode_plan() {
        let payload = json!({
            "queryPlan": { "kind": "QueryPlan", "node": { "kind": "Fetch", "serviceName": "a" } },
            "formattedQueryPlan": "QueryPlan {}",
            "usageReporting": {
                "statsReportKey": "# -\n{hello}",
                "referencedFieldsByType": {
                    "Query": { "fieldNames": ["hello"], "isInterface": false }
                }
            }
        });
        let result = WorkerResult::decode("1", RequestKind::Plan, payload, 20).unwrap();
        let WorkerResult::Plan(plan) = result else {
            panic!("expected a plan");
        };
        assert_eq!(plan.query_plan["node"]["serviceName"], "a");
        assert_eq!(
            plan.usage_reporting.referenced_fields_by_type["Query"].field_names,
            vec!["hello".to_string()]
        );
    }

    #[test]
    fn test_decode_composition_truncates_hint_nodes() {
        let nodes: Vec<Value> = (0..25).map(|i| json!({ "subgraph": format!("s{i}") })).collect();
        let payload = json!({
            "supergraphSdl": "schema {}",
            "hints": [{ "message": "m", "code": "C", "nodes": nodes }]
        });
        let result = WorkerResult::decode("1", RequestKind::Compose, payload, 20).unwrap();
        let WorkerResult::Composition(output) = result else {
            panic!("expected a composition");
        };
        assert_eq!(output.hints[0].nodes.len(), 20);
        assert_eq!(output.hints[0].omitted_nodes_count, Some(5));
    }

    #[test]
    fn test_decode_mismatched_payload() {
        let err = WorkerResult::decode("req", RequestKind::Signature, json!({ "nope": 1 }), 20)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Deserialization { ref id, .. } if id == "req"));
    }
}
