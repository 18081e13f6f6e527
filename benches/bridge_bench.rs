//! Request round-trip benchmarks against the test fixture library.

use criterion::{criterion_group, criterion_main, Criterion};
use federation_bridge::{
    BridgeConfig, PlanOptions, Planner, QueryPlannerConfig, RequestPayload, SchemaSource,
    ScriptPayload, Worker,
};
use std::sync::Arc;

const LIBRARY: &str = include_str!("../src/testdata/federation_fixture.js");

const SUPERGRAPH: &str = r#"
enum join__Graph {
  ACCOUNTS @join__graph(name: "accounts", url: "http://accounts")
  PRODUCTS @join__graph(name: "products", url: "http://products")
}

type Query @join__type(graph: ACCOUNTS) @join__type(graph: PRODUCTS) {
  me: User @join__field(graph: ACCOUNTS)
  topProducts: [Product] @join__field(graph: PRODUCTS)
}

type User @join__type(graph: ACCOUNTS, key: "id") {
  id: ID!
  name: String
}

type Product @join__type(graph: PRODUCTS, key: "upc") {
  upc: String!
  price: Int
}
"#;

const QUERY: &str = "query Home { me { name } topProducts { upc price } }";

fn spawn(runtime: &tokio::runtime::Runtime) -> Arc<Worker> {
    runtime.block_on(async {
        let payload = ScriptPayload::with_library("federation_fixture.js", LIBRARY);
        Arc::new(Worker::spawn(payload, BridgeConfig::default()).await.unwrap())
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bench_query_planning(c: &mut Criterion) {
    init_tracing();
    c.bench_function("query_planning", |b| {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let worker = spawn(&runtime);
        let planner = runtime.block_on(async {
            Planner::new(
                worker,
                SchemaSource::supergraph(SUPERGRAPH),
                QueryPlannerConfig::default(),
            )
            .await
            .unwrap()
        });

        b.to_async(&runtime).iter(|| async {
            planner
                .plan(QUERY, Some("Home".into()), PlanOptions::default())
                .await
                .unwrap();
        });
    });
}

fn bench_heap_statistics(c: &mut Criterion) {
    c.bench_function("heap_statistics_round_trip", |b| {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let worker = spawn(&runtime);

        b.to_async(&runtime).iter(|| async {
            worker
                .request(RequestPayload::GetHeapStatistics)
                .await
                .unwrap();
        });
    });
}

fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker");
    group.sample_size(10);
    group.bench_function("spawn_and_shutdown", |b| {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        b.to_async(&runtime).iter(|| async {
            let payload = ScriptPayload::with_library("federation_fixture.js", LIBRARY);
            let worker = Worker::spawn(payload, BridgeConfig::default()).await.unwrap();
            worker.shutdown().await.unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_query_planning, bench_heap_statistics, bench_spawn);
criterion_main!(benches);
