//! Benchmarks for the branch-based evaluation engine.
//!
//! Measures:
//!   1. Tree evaluation at various resolutions (constant → noise → octaves)
//!   2. Graph complexity scaling at a fixed resolution
//!   3. Multi-branch nodes (Resample, Normals, LodChain)
//!   4. Asset path: JSON parse → amplify → evaluate
//!   5. Height-map cache hits against full evaluation
//!
//! Run with:
//!   cargo bench --bench eval_bench
//!
//! Results are written to `target/criterion/` with HTML reports.

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput,
};
use serde_json::{json, Value};
use std::sync::Arc;
use terraforge_lib::eval::extensions::{BranchExtensions, HeightmapCache};
use terraforge_lib::eval::graph::{Graph, NodeDefinition};
use terraforge_lib::eval::ports::PortData;
use terraforge_lib::eval::tree::TreeRequest;
use terraforge_lib::eval::value::SharedBuffer;
use terraforge_lib::{Engine, EngineConfig};

// ── Graph builder helpers ──────────────────────────────────────────

fn make_node(id: &str, kind: &str, fields: &[(&str, Value)]) -> NodeDefinition {
    fields
        .iter()
        .fold(NodeDefinition::new(id, kind), |def, (k, v)| def.with_field(k, v.clone()))
}

fn make_edge(graph: &mut Graph, source: &str, source_field: &str, handle: PortData) {
    graph
        .connect(PortData::new(source.into(), source_field), handle)
        .unwrap();
}

fn into_output(graph: &mut Graph, source: &str) {
    graph.add_node(make_node("out", "Output", &[])).unwrap();
    make_edge(graph, source, "Value", PortData::new("out".into(), "Input"));
}

// ── Graph factories ────────────────────────────────────────────────

fn graph_constant() -> Graph {
    let mut graph = Graph::new();
    graph
        .add_node(make_node("c", "Constant", &[("Value", json!(1.0))]))
        .unwrap();
    into_output(&mut graph, "c");
    graph
}

fn graph_noise() -> Graph {
    let mut graph = Graph::new();
    graph
        .add_node(make_node("n", "Noise", &[("Frequency", json!(0.02))]))
        .unwrap();
    into_output(&mut graph, "n");
    graph
}

fn graph_octaves(engine: &Engine, octaves: u32) -> Graph {
    let mut graph = Graph::new();
    graph
        .add_node(make_node("oct", "Octaves", &[("Octaves", json!(octaves))]))
        .unwrap();
    into_output(&mut graph, "oct");
    engine.prepare_graph(&mut graph, None).unwrap();
    graph
}

/// Noise ridges: max of two noises, scaled by the X coordinate.
fn graph_mixed() -> Graph {
    let mut graph = Graph::new();
    graph
        .add_node(make_node("a", "Noise", &[("Seed", json!(1)), ("Frequency", json!(0.01))]))
        .unwrap();
    graph
        .add_node(make_node("b", "Noise", &[("Seed", json!(2)), ("Frequency", json!(0.05))]))
        .unwrap();
    graph
        .add_node(make_node("m", "Combine", &[("Operation", json!("Max"))]))
        .unwrap();
    graph.add_node(make_node("x", "CoordinateX", &[])).unwrap();
    graph
        .add_node(make_node("p", "Combine", &[("Operation", json!("Product"))]))
        .unwrap();
    make_edge(&mut graph, "a", "Value", PortData::list_item("m".into(), "Inputs", 0));
    make_edge(&mut graph, "b", "Value", PortData::list_item("m".into(), "Inputs", 1));
    make_edge(&mut graph, "m", "Value", PortData::list_item("p".into(), "Inputs", 0));
    make_edge(&mut graph, "x", "Value", PortData::list_item("p".into(), "Inputs", 1));
    into_output(&mut graph, "p");
    graph
}

fn graph_multi_branch(kind: &str, fields: &[(&str, Value)], input: &str) -> Graph {
    let mut graph = Graph::new();
    graph
        .add_node(make_node("n", "Noise", &[("Frequency", json!(0.02))]))
        .unwrap();
    graph.add_node(make_node("k", kind, fields)).unwrap();
    make_edge(&mut graph, "n", "Value", PortData::new("k".into(), input));
    graph
}

fn evaluate(engine: &Engine, graph: &Arc<Graph>, res: u32) {
    let tree = engine
        .new_tree(TreeRequest::new(graph.clone()).with_resolution(res))
        .unwrap();
    tree.process_blocking().unwrap();
    black_box(tree.try_get_output::<SharedBuffer>(&"out".into(), "Height", None));
}

// ── Benchmarks ─────────────────────────────────────────────────────

/// Whole-tree evaluation at increasing resolutions.
fn bench_resolution(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let mut group = c.benchmark_group("resolution");
    let resolutions: &[u32] = &[32, 64, 128, 256];

    let graphs: Vec<(&str, Arc<Graph>)> = vec![
        ("constant", Arc::new(graph_constant())),
        ("noise", Arc::new(graph_noise())),
        ("octaves_6", Arc::new(graph_octaves(&engine, 6))),
    ];

    for (label, graph) in &graphs {
        for &res in resolutions {
            let param = format!("{label}/{res}");
            group.throughput(Throughput::Elements(((res + 1) as u64).pow(2)));
            group.bench_with_input(BenchmarkId::new("tree", &param), &res, |b, &res| {
                b.iter(|| evaluate(&engine, graph, res));
            });
        }
    }

    group.finish();
}

/// Same resolution, increasing graph complexity.
fn bench_graph_complexity(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let mut group = c.benchmark_group("graph_complexity");
    let res: u32 = 128;

    let graphs: Vec<(&str, Arc<Graph>)> = vec![
        ("constant", Arc::new(graph_constant())),
        ("noise", Arc::new(graph_noise())),
        ("mixed", Arc::new(graph_mixed())),
        ("octaves_4", Arc::new(graph_octaves(&engine, 4))),
        ("octaves_8", Arc::new(graph_octaves(&engine, 8))),
    ];

    for (label, graph) in &graphs {
        group.throughput(Throughput::Elements(((res + 1) as u64).pow(2)));
        group.bench_function(BenchmarkId::new("tree_128", label), |b| {
            b.iter(|| evaluate(&engine, graph, res));
        });
    }

    group.finish();
}

/// Nodes that derive branches of their own.
fn bench_multi_branch(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let mut group = c.benchmark_group("multi_branch");
    let res: u32 = 128;

    let graphs: Vec<(&str, Arc<Graph>)> = vec![
        ("resample_64", Arc::new(graph_multi_branch("Resample", &[("Resolution", json!(64))], "Input"))),
        ("normals", Arc::new(graph_multi_branch("Normals", &[], "Height"))),
        ("lod_chain_4", Arc::new(graph_multi_branch("LodChain", &[("Levels", json!(4))], "Input"))),
    ];

    for (label, graph) in &graphs {
        group.bench_function(BenchmarkId::new("tree_128", label), |b| {
            b.iter(|| {
                let tree = engine
                    .new_tree(
                        TreeRequest::new(graph.clone())
                            .with_resolution(res)
                            .with_starting_nodes(vec!["k".into()]),
                    )
                    .unwrap();
                tree.process_blocking().unwrap();
                black_box(tree.branch_count())
            });
        });
    }

    group.finish();
}

/// JSON parse → amplify → evaluate, as a caller loading an asset would.
fn bench_asset_roundtrip(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let mut group = c.benchmark_group("asset_roundtrip");

    let asset = json!({
        "nodes": [
            {"id": "base", "data": {"type": "Constant", "fields": {"Value": 20}}},
            {"id": "detail", "data": {"type": "Octaves", "fields": {"Octaves": 5, "Amplitude": 8}}},
            {"id": "sum", "data": {"type": "Combine"}},
            {"id": "out", "data": {"type": "Output"}}
        ],
        "edges": [
            {"source": "base", "target": "sum", "targetHandle": "Inputs[0]"},
            {"source": "detail", "target": "sum", "targetHandle": "Inputs[1]"},
            {"source": "sum", "target": "out"}
        ]
    })
    .to_string();

    for &res in &[32u32, 128] {
        group.bench_with_input(BenchmarkId::new("load_and_eval", res), &res, |b, &res| {
            b.iter(|| {
                let graph = Arc::new(engine.load_graph(&asset, None).unwrap());
                evaluate(&engine, &graph, res);
            });
        });
    }

    group.finish();
}

/// A warm height-map cache against evaluating from scratch.
fn bench_heightmap_cache(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let mut group = c.benchmark_group("heightmap_cache");
    let graph = Arc::new(graph_octaves(&engine, 6));
    let cache = Arc::new(HeightmapCache::from_config(engine.config()));
    let res: u32 = 128;

    group.bench_function("cold", |b| b.iter(|| evaluate(&engine, &graph, res)));
    group.bench_function("warm", |b| {
        b.iter(|| {
            let tree = engine
                .new_tree(
                    TreeRequest::new(graph.clone())
                        .with_resolution(res)
                        .with_extensions(BranchExtensions::new().with(cache.clone())),
                )
                .unwrap();
            tree.process_blocking().unwrap();
            black_box(tree.try_get_output::<SharedBuffer>(&"out".into(), "Height", None))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_resolution,
    bench_graph_complexity,
    bench_multi_branch,
    bench_asset_roundtrip,
    bench_heightmap_cache,
);
criterion_main!(benches);
