//! Result translator.
//!
//! The worker script serializes every throwable it catches into an
//! [`ErrorObject`]. This module turns those objects into host-native
//! [`EngineError`] values, decides whether each one is a validation error,
//! caps oversized node lists and encodes host requests for the script.

use crate::error::{BridgeError, Result};
use crate::protocol::{CorrelationId, RequestEnvelope, RequestPayload, MAX_SCHEMA_ID};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Names that mark an error as GraphQL-like even without GraphQL fields
pub const GRAPHQL_ERROR_NAMES: &[&str] =
    &["GraphQLError", "GraphQLValidationError", "GraphQLSyntaxError"];

/// Name the worker script gives to envelope and routing failures
pub const PROTOCOL_ERROR_NAME: &str = "ProtocolError";

/// Engine errors after which a context can't be trusted, as (name, message)
pub const FATAL_ENGINE_ERRORS: &[(&str, &str)] = &[
    ("InternalError", "out of memory"),
    ("InternalError", "stack overflow"),
    ("RangeError", "Maximum call stack size exceeded"),
];

/// Position in a source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// 1-indexed line
    pub line: u32,
    /// 1-indexed column
    pub column: u32,
}

/// Path segment of a GraphQL error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// List index
    Index(u64),
    /// Field name or alias
    Key(String),
}

/// Serialized throwable, as produced by the worker script
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorObject {
    /// Constructor name (`Error`, `TypeError`, `GraphQLError`, ...)
    #[serde(default)]
    pub name: Option<String>,
    /// Error message
    #[serde(default)]
    pub message: Option<String>,
    /// Script stack trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Explicit validation flag set by the library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<bool>,
    /// Source locations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
    /// Response path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    /// GraphQL extensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
    /// AST nodes the error refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<Value>>,
    /// Nodes already dropped by the script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omitted_nodes_count: Option<u32>,
    /// Wrapped error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<Box<ErrorObject>>,
    /// Underlying causes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<ErrorObject>>,
}

impl ErrorObject {
    /// A plain error with a name and message
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Whether this object describes a GraphQL error
    pub fn is_graphql_like(&self) -> bool {
        self.locations.is_some()
            || self.path.is_some()
            || self.extensions.is_some()
            || self.nodes.is_some()
            || self
                .name
                .as_deref()
                .is_some_and(|name| GRAPHQL_ERROR_NAMES.contains(&name))
    }

    /// Whether the engine itself failed (out of memory, stack exhausted)
    pub fn is_fatal_engine_error(&self) -> bool {
        let (Some(name), Some(message)) = (self.name.as_deref(), self.message.as_deref()) else {
            return false;
        };
        FATAL_ENGINE_ERRORS
            .iter()
            .any(|(fatal_name, fatal_message)| name == *fatal_name && message == *fatal_message)
    }
}

/// GraphQL error raised by the library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGraphQLError {
    /// Constructor name
    pub name: String,
    /// Error message
    pub message: String,
    /// Source locations, capped at the nodes limit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    /// Response path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    /// GraphQL extensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
    /// AST nodes, capped at the nodes limit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Value>,
    /// Entries dropped from `nodes` and `locations`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omitted_nodes_count: Option<u32>,
    /// Translated wrapped error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<Box<EngineError>>,
    /// Translated causes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<EngineError>,
    /// Whether the caller's input is at fault
    pub validation_error: bool,
}

impl WorkerGraphQLError {
    /// The `code` extension, if any
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

/// Generic script error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsError {
    /// Constructor name
    pub name: Option<String>,
    /// Error message
    pub message: Option<String>,
    /// Script stack trace
    pub stack: Option<String>,
    /// Whether the caller's input is at fault
    pub validation_error: bool,
    /// Translated causes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<EngineError>,
}

/// A translated script error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineError {
    /// GraphQL-like error
    GraphQL(WorkerGraphQLError),
    /// Any other throwable
    Js(JsError),
}

impl EngineError {
    /// Error message, empty when the script gave none
    pub fn message(&self) -> &str {
        match self {
            EngineError::GraphQL(e) => &e.message,
            EngineError::Js(e) => e.message.as_deref().unwrap_or_default(),
        }
    }

    /// Constructor name
    pub fn name(&self) -> Option<&str> {
        match self {
            EngineError::GraphQL(e) => Some(&e.name),
            EngineError::Js(e) => e.name.as_deref(),
        }
    }

    /// Whether the caller's input is at fault
    pub fn is_validation(&self) -> bool {
        match self {
            EngineError::GraphQL(e) => e.validation_error,
            EngineError::Js(e) => e.validation_error,
        }
    }

    /// Translated causes
    pub fn causes(&self) -> &[EngineError] {
        match self {
            EngineError::GraphQL(e) => &e.causes,
            EngineError::Js(e) => &e.causes,
        }
    }

    /// Place in the error taxonomy
    pub fn category(&self) -> ErrorCategory {
        if self.name() == Some(PROTOCOL_ERROR_NAME) {
            ErrorCategory::Protocol
        } else if self.is_validation() {
            ErrorCategory::Validation
        } else {
            ErrorCategory::Engine
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::GraphQL(e) => {
                f.write_str(&e.message)?;
                if let Some(location) = e.locations.first() {
                    write!(f, " ({}:{})", location.line, location.column)?;
                }
                Ok(())
            }
            EngineError::Js(e) => match (&e.name, &e.message) {
                (Some(name), Some(message)) => write!(f, "{name}: {message}"),
                (None, Some(message)) => f.write_str(message),
                (Some(name), None) => f.write_str(name),
                (None, None) => f.write_str("unknown script error"),
            },
        }
    }
}

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    /// Bad input; the session stays usable
    Validation,
    /// Unexpected library failure; the session stays usable
    Engine,
    /// Unknown kind, unknown session or broken envelope
    Protocol,
    /// The worker is gone
    FatalWorker,
}

/// Every error the script reported for one response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatalError {
    /// Correlation id of the failed request; absent for broadcast failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    /// Translated errors
    pub errors: Vec<EngineError>,
}

impl FatalError {
    /// Translate serialized errors for the request `id`
    pub fn from_objects(
        id: Option<CorrelationId>,
        objects: Vec<ErrorObject>,
        nodes_limit: usize,
    ) -> Self {
        Self {
            id,
            errors: translate_all(objects, nodes_limit),
        }
    }

    /// Whether every error is a validation error
    pub fn is_validation(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(EngineError::is_validation)
    }

    /// Least recoverable category among the errors
    pub fn category(&self) -> ErrorCategory {
        if self.is_validation() {
            ErrorCategory::Validation
        } else if self
            .errors
            .iter()
            .any(|e| e.category() == ErrorCategory::Protocol)
        {
            ErrorCategory::Protocol
        } else {
            ErrorCategory::Engine
        }
    }
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for error in &self.errors {
            if !first {
                f.write_str("\n")?;
            }
            first = false;
            write!(f, "{error}")?;
        }
        if first {
            f.write_str("script reported an empty error list")?;
        }
        Ok(())
    }
}

impl std::error::Error for FatalError {}

/// Keep at most `limit` items; returns how many were dropped
pub fn truncate<T>(items: &mut Vec<T>, limit: usize) -> Option<u32> {
    if items.len() <= limit {
        return None;
    }
    let omitted = items.len() - limit;
    items.truncate(limit);
    Some(u32::try_from(omitted).unwrap_or(u32::MAX))
}

/// Translate one serialized throwable
pub fn translate(object: ErrorObject, nodes_limit: usize) -> EngineError {
    let graphql_like = object.is_graphql_like();
    let validation_error = object.validation_error.unwrap_or(graphql_like);
    let causes = object
        .causes
        .unwrap_or_default()
        .into_iter()
        .map(|cause| translate(cause, nodes_limit))
        .collect();

    if !graphql_like {
        return EngineError::Js(JsError {
            name: object.name,
            message: object.message,
            stack: object.stack,
            validation_error,
            causes,
        });
    }

    let mut locations = object.locations.unwrap_or_default();
    let mut nodes = object.nodes.unwrap_or_default();
    let omitted = [
        object.omitted_nodes_count,
        truncate(&mut nodes, nodes_limit),
        truncate(&mut locations, nodes_limit),
    ]
    .into_iter()
    .flatten()
    .reduce(|a, b| a.saturating_add(b));

    EngineError::GraphQL(WorkerGraphQLError {
        name: object.name.unwrap_or_else(|| "GraphQLError".to_string()),
        message: object.message.unwrap_or_default(),
        locations,
        path: object.path,
        extensions: object.extensions,
        nodes,
        omitted_nodes_count: omitted,
        original_error: object
            .original_error
            .map(|original| Box::new(translate(*original, nodes_limit))),
        causes,
        validation_error,
    })
}

/// Translate a list of serialized throwables
pub fn translate_all(objects: Vec<ErrorObject>, nodes_limit: usize) -> Vec<EngineError> {
    objects
        .into_iter()
        .map(|object| translate(object, nodes_limit))
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<ErrorObject>),
    One(Box<ErrorObject>),
}

/// Split a response payload into its success value or its error objects.
///
/// A payload is an error when it carries a top-level `errors` key, which may
/// hold a single serialized throwable or an array of them.
pub fn split_payload(payload: Value) -> std::result::Result<Value, Vec<ErrorObject>> {
    let Value::Object(mut map) = payload else {
        return Ok(payload);
    };
    let Some(errors) = map.remove("errors") else {
        return Ok(Value::Object(map));
    };
    let objects = match serde_json::from_value::<OneOrMany>(errors.clone()) {
        Ok(OneOrMany::Many(objects)) => objects,
        Ok(OneOrMany::One(object)) => vec![*object],
        Err(_) => vec![ErrorObject::new("Error", errors.to_string())],
    };
    Err(objects)
}

/// Encode a request envelope for the script
pub fn encode_request(
    id: Option<&str>,
    payload: &RequestPayload,
    nodes_limit: usize,
) -> Result<String> {
    if let Some(schema_id) = payload.schema_id().filter(|id| *id > MAX_SCHEMA_ID) {
        return Err(BridgeError::Protocol(format!(
            "schema id {schema_id} is above {MAX_SCHEMA_ID} and can't be represented in the script"
        )));
    }
    let envelope = RequestEnvelope {
        id,
        nodes_limit,
        payload,
    };
    serde_json::to_string(&envelope).map_err(|e| BridgeError::Serialization {
        name: payload.kind().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> ErrorObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_graphql_like_by_fields() {
        let translated = translate(
            object(json!({
                "name": "Error",
                "message": "Cannot query field \"nope\" on type \"Query\".",
                "locations": [{ "line": 1, "column": 3 }],
                "path": ["nope"]
            })),
            20,
        );
        let EngineError::GraphQL(error) = &translated else {
            panic!("expected a GraphQL error");
        };
        assert!(error.validation_error);
        assert_eq!(error.locations, vec![Location { line: 1, column: 3 }]);
        assert_eq!(error.path, Some(vec![PathSegment::Key("nope".into())]));
        assert_eq!(translated.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_graphql_like_by_name() {
        let translated = translate(ErrorObject::new("GraphQLValidationError", "bad"), 20);
        assert!(matches!(translated, EngineError::GraphQL(_)));
        assert!(translated.is_validation());
    }

    #[test]
    fn test_generic_error_is_not_validation() {
        let translated = translate(
            object(json!({ "name": "TypeError", "message": "x is undefined", "stack": "at f" })),
            20,
        );
        let EngineError::Js(error) = &translated else {
            panic!("expected a generic error");
        };
        assert!(!error.validation_error);
        assert_eq!(error.stack.as_deref(), Some("at f"));
        assert_eq!(translated.category(), ErrorCategory::Engine);
        assert_eq!(translated.to_string(), "TypeError: x is undefined");
    }

    #[test]
    fn test_explicit_flag_wins() {
        let generic = translate(
            object(json!({ "name": "Error", "message": "m", "validationError": true })),
            20,
        );
        assert!(matches!(generic, EngineError::Js(_)));
        assert!(generic.is_validation());

        let graphql = translate(
            object(json!({ "name": "GraphQLError", "message": "m", "validationError": false })),
            20,
        );
        assert!(matches!(graphql, EngineError::GraphQL(_)));
        assert!(!graphql.is_validation());
    }

    #[test]
    fn test_protocol_errors_are_recognized() {
        let translated = translate(ErrorObject::new("ProtocolError", "no such session: 4"), 20);
        assert_eq!(translated.category(), ErrorCategory::Protocol);
        let fatal = FatalError {
            id: Some("x".into()),
            errors: vec![translated],
        };
        assert_eq!(fatal.category(), ErrorCategory::Protocol);
    }

    #[test]
    fn test_nested_causes() {
        let translated = translate(
            object(json!({
                "name": "Error",
                "message": "composition failed",
                "causes": [
                    {
                        "name": "GraphQLError",
                        "message": "field conflict",
                        "extensions": { "code": "INVALID_FIELD_SHARING" },
                        "causes": [{ "name": "TypeError", "message": "deepest" }]
                    }
                ]
            })),
            20,
        );
        assert_eq!(translated.causes().len(), 1);
        let EngineError::GraphQL(cause) = &translated.causes()[0] else {
            panic!("cause should stay GraphQL-like");
        };
        assert_eq!(cause.code(), Some("INVALID_FIELD_SHARING"));
        assert_eq!(cause.causes.len(), 1);
        assert_eq!(cause.causes[0].message(), "deepest");
        assert!(cause.causes[0].causes().is_empty());
    }

    #[test]
    fn test_original_error_is_translated() {
        let translated = translate(
            object(json!({
                "name": "GraphQLError",
                "message": "[a] Syntax Error",
                "originalError": { "name": "GraphQLError", "message": "Syntax Error" }
            })),
            20,
        );
        let EngineError::GraphQL(error) = translated else {
            panic!("expected a GraphQL error");
        };
        assert_eq!(error.original_error.unwrap().message(), "Syntax Error");
    }

    #[test]
    fn test_nodes_truncation() {
        let nodes: Vec<Value> = (0..23).map(|i| json!({ "subgraph": i })).collect();
        let locations: Vec<Value> = (0..21).map(|i| json!({ "line": i + 1, "column": 1 })).collect();
        let translated = translate(
            object(json!({
                "name": "GraphQLError",
                "message": "too many",
                "nodes": nodes,
                "locations": locations
            })),
            20,
        );
        let EngineError::GraphQL(error) = translated else {
            panic!("expected a GraphQL error");
        };
        assert_eq!(error.nodes.len(), 20);
        assert_eq!(error.locations.len(), 20);
        assert_eq!(error.omitted_nodes_count, Some(4));
    }

    #[test]
    fn test_no_truncation_below_limit() {
        let mut items = vec![1, 2, 3];
        assert_eq!(truncate(&mut items, 3), None);
        assert_eq!(items.len(), 3);
        assert_eq!(truncate(&mut items, 1), Some(2));
        assert_eq!(items, vec![1]);
    }

    #[test]
    fn test_split_payload() {
        let ok = split_payload(json!({ "signature": "# -\n{a}" })).unwrap();
        assert_eq!(ok["signature"], "# -\n{a}");

        let many = split_payload(json!({ "errors": [{ "name": "Error", "message": "a" }] }))
            .unwrap_err();
        assert_eq!(many.len(), 1);

        let one = split_payload(json!({ "errors": { "name": "Error", "message": "b" } }))
            .unwrap_err();
        assert_eq!(one[0].message.as_deref(), Some("b"));

        let junk = split_payload(json!({ "errors": 42 })).unwrap_err();
        assert_eq!(junk[0].message.as_deref(), Some("42"));
    }

    #[test]
    fn test_fatal_error_display() {
        let fatal = FatalError::from_objects(
            None,
            vec![
                ErrorObject::new("GraphQLError", "first"),
                ErrorObject::new("Error", "second"),
            ],
            20,
        );
        assert_eq!(fatal.to_string(), "first\nError: second");
        assert!(!fatal.is_validation());
        assert_eq!(fatal.category(), ErrorCategory::Engine);
    }

    #[test]
    fn test_encode_request() {
        let raw =
            encode_request(Some("id-1"), &RequestPayload::ApiSchema { schema_id: 2 }, 20).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "id-1",
                "nodesLimit": 20,
                "payload": { "kind": "ApiSchema", "schemaId": 2 }
            })
        );
    }

    #[test]
    fn test_encode_request_rejects_unsafe_schema_ids() {
        let err = encode_request(
            Some("id-2"),
            &RequestPayload::ApiSchema {
                schema_id: MAX_SCHEMA_ID + 1,
            },
            20,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));

        let err = encode_request(
            None,
            &RequestPayload::Exit {
                schema_id: Some(u64::MAX),
            },
            20,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));

        encode_request(None, &RequestPayload::Exit { schema_id: Some(MAX_SCHEMA_ID) }, 20).unwrap();
    }

    #[test]
    fn test_fatal_engine_errors() {
        assert!(ErrorObject::new("InternalError", "out of memory").is_fatal_engine_error());
        assert!(ErrorObject::new("InternalError", "stack overflow").is_fatal_engine_error());
        assert!(!ErrorObject::new("Error", "out of memory").is_fatal_engine_error());
        assert!(!ErrorObject::new("InternalError", "interrupted").is_fatal_engine_error());
        assert!(!ErrorObject::default().is_fatal_engine_error());
    }
}
