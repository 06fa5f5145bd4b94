use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Value, json};
use tokio::runtime::Runtime;

use age_graph_sync::prelude::*;

fn lcg_next(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state
}

fn props(value: Value) -> PropertyMap {
    match value {
        Value::Object(map) => map,
        _ => PropertyMap::new(),
    }
}

fn ident(value: String) -> Ident {
    Ident::new(value).expect("generated idents are non-empty")
}

fn nested_properties(width: usize, seed: u64) -> PropertyMap {
    let mut map = PropertyMap::new();
    for idx in 0..width {
        map.insert(
            format!("k{idx}"),
            json!({"value": seed.wrapping_add(idx as u64), "tags": ["a", "b"], "inner": {"depth": idx}}),
        );
    }
    map
}

fn synthetic_fragment(vertex_count: usize, edge_count: usize) -> GraphFragment {
    let vertices = (0..vertex_count)
        .map(|idx| {
            VertexSpec::new(
                ident(format!("v{idx}")),
                "Node",
                props(json!({"idx": idx, "meta": {"bucket": idx % 7}})),
            )
        })
        .collect::<Vec<_>>();

    let mut state = 0x1234_5678_9abc_def0u64;
    let edges = (0..edge_count)
        .map(|idx| {
            let a = (lcg_next(&mut state) as usize) % vertex_count;
            let b = (lcg_next(&mut state) as usize) % vertex_count;
            EdgeSpec::new(
                "LINKS",
                ident(format!("v{a}")),
                ident(format!("v{b}")),
                props(json!({"order": idx})),
            )
        })
        .collect::<Vec<_>>();

    GraphFragment { vertices, edges }
}

fn operations() -> GraphOperations<MemoryStore> {
    GraphOperations::new(
        Arc::new(MemoryStore::new()),
        AgeSettings::default(),
        ReconcileSettings::default(),
    )
    .expect("default settings are valid")
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    for width in [8usize, 64, 512] {
        let existing = nested_properties(width, 1);
        let incoming = nested_properties(width / 2, 2);

        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(
            BenchmarkId::new("deep_merge", width),
            &(existing, incoming),
            |b, (existing, incoming)| {
                b.iter(|| {
                    let merged = merge(existing, incoming);
                    black_box(PropertyDelta::between(existing, &merged));
                });
            },
        );
    }
    group.finish();
}

fn bench_upsert_graph(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let graph = GraphName::new("bench_graph").expect("valid graph name");
    let mut group = c.benchmark_group("upsert_graph");
    group.sample_size(20);

    for (vertices, edges) in [(200usize, 400usize), (1_000, 2_000)] {
        let fragment = synthetic_fragment(vertices, edges);
        group.throughput(Throughput::Elements((vertices + edges) as u64));

        group.bench_with_input(
            BenchmarkId::new("fresh", format!("{vertices}v_{edges}e")),
            &fragment,
            |b, fragment| {
                b.iter_batched(
                    operations,
                    |ops| {
                        runtime.block_on(async {
                            black_box(ops.upsert_graph(&graph, fragment).await.expect("reconcile"))
                        })
                    },
                    BatchSize::LargeInput,
                );
            },
        );

        let warm = operations();
        runtime
            .block_on(warm.upsert_graph(&graph, &fragment))
            .expect("seed reconcile");
        group.bench_with_input(
            BenchmarkId::new("unchanged", format!("{vertices}v_{edges}e")),
            &fragment,
            |b, fragment| {
                b.iter(|| {
                    runtime.block_on(async {
                        black_box(warm.upsert_graph(&graph, fragment).await.expect("reconcile"))
                    })
                });
            },
        );
    }
    group.finish();
}

criterion_group!(reconcile_checks, bench_merge, bench_upsert_graph);
criterion_main!(reconcile_checks);
