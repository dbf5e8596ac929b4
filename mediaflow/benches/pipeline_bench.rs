//! Benchmarks for stage graph construction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mediaflow::catalog::StageCatalog;
use mediaflow::core::{FeatureFlags, WorkflowMode};
use mediaflow::pipeline::GraphBuilder;

const OPTIONAL: [&str; 5] = [
    "source_separation",
    "vad",
    "diarization",
    "bias_correction",
    "scene_grouping",
];

fn graph_benchmark(c: &mut Criterion) {
    let Ok(catalog) = StageCatalog::media_default() else {
        return;
    };
    let builder = GraphBuilder::new(&catalog);

    let mut group = c.benchmark_group("graph_build");
    for mode in [
        WorkflowMode::Full,
        WorkflowMode::TranscribeOnly,
        WorkflowMode::TranslateOnly,
        WorkflowMode::SubtitleOnly,
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(mode), &mode, |b, &mode| {
            let flags = FeatureFlags::new();
            b.iter(|| builder.build(black_box(mode), black_box(&flags)));
        });
    }
    group.finish();

    let flag_sets: Vec<FeatureFlags> = (0..1u32 << OPTIONAL.len())
        .map(|bits| {
            OPTIONAL
                .iter()
                .enumerate()
                .fold(FeatureFlags::new(), |flags, (i, name)| {
                    flags.with(*name, bits & (1 << i) != 0)
                })
        })
        .collect();

    c.bench_function("graph_build_all_flag_sets", |b| {
        b.iter(|| {
            for flags in &flag_sets {
                let graph = builder.build(WorkflowMode::Full, flags);
                black_box(graph.map(|g| g.fingerprint()).ok());
            }
        });
    });
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
