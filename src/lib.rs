//! # Federation Bridge
//!
//! Runs a JavaScript GraphQL composition and query-planning library inside
//! supervised QuickJS workers and exposes it through a typed async API.
//!
//! ## Architecture
//!
//! ```text
//! Planner / compose()          (typed API, one session per Planner)
//!     │
//!     │ RequestPayload
//!     ▼
//! Worker / WorkerPool          (supervisor, correlation ids, timeouts)
//!     │
//!     │ JSON envelopes over the request queue
//!     ▼
//! QuickJS worker thread        (prelude + library + worker loop)
//! ```
//!
//! ## Features
//!
//! - **Dedicated threads**: each worker owns one engine and one OS thread
//! - **Exactly one reply**: every request resolves once, with a result, a
//!   timeout or a worker failure
//! - **Structured errors**: thrown script errors become [`EngineError`]s with
//!   locations, causes and a validation flag
//! - **Sessions**: several schemas can share one worker; a pool pins each
//!   session to its worker
//!
//! ## Example
//!
//! ```no_run
//! use federation_bridge::{
//!     BridgeConfig, PlanOptions, Planner, QueryPlannerConfig, SchemaSource, ScriptPayload,
//!     Worker,
//! };
//!
//! # async fn run(supergraph: String) -> federation_bridge::Result<()> {
//! let payload = ScriptPayload::from_file("bundle/federation.js")?;
//! let worker = Worker::spawn(payload, BridgeConfig::from_env()?).await?;
//! let planner = Planner::new(
//!     worker,
//!     SchemaSource::supergraph(supergraph),
//!     QueryPlannerConfig::default(),
//! )
//! .await?;
//! let plan = planner.plan("{ me { name } }", None, PlanOptions::default()).await?;
//! println!("{}", plan.formatted_query_plan.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod channel;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod host_functions;
pub mod metrics;
pub mod planner;
pub mod protocol;
pub mod translate;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use engine::instance::WorkerState;
pub use engine::payload::{ScriptPayload, ScriptSource};
pub use engine::pool::WorkerPool;
pub use engine::{PlannerBackend, Worker};
pub use error::{BridgeError, ErrorCode, Result};
pub use metrics::{MetricsSnapshot, WorkerMetrics};
pub use planner::{compose, compose_with_nodes_limit, Planner};
pub use protocol::{
    CompositionHint, CompositionOutput, HeapStatistics, PlanOptions, PlanSuccess,
    QueryPlannerConfig, RequestPayload, SchemaId, SchemaSource, SubgraphDefinition,
    UsageReporting, WorkerResult,
};
pub use translate::{EngineError, ErrorCategory, FatalError};

/// Script evaluated before any library source: console, timers, crypto and
/// the `bridge` channel object
pub const BRIDGE_PRELUDE: &str = include_str!("js/prelude.js");

/// Script evaluated last: the request loop
pub const WORKER_LOOP: &str = include_str!("js/worker.js");

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
