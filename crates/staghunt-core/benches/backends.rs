//! Inference latency of the three backends on one stag-hunt scenario.
//!
//! Every backend is first checked against the explicit reference so a
//! regression in the message updates cannot hide behind a faster number.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use staghunt_core::engine::numeric_kernels::{DEFAULT_ATOL, DEFAULT_RTOL};
use staghunt_core::{
    BeliefPropagationConfig, ExplicitBackend, FactorGraph, GameConfig, InferenceBackend,
    ModelParams, StagHuntModel, VectorizedBackend,
};

fn scenario_graph(size: usize, agents: usize) -> FactorGraph {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let config = GameConfig::sample(&mut rng, size, size, agents).expect("scenario");
    let params = ModelParams {
        lambda: 2.0,
        r_h: -2.0,
        r_s: -7.0,
        horizon: 6,
        ..ModelParams::default()
    };
    let mut model = StagHuntModel::new(config, params).expect("valid scenario");
    model.fast_build_model().expect("build").clone()
}

fn backends() -> Vec<Box<dyn InferenceBackend>> {
    let mut out: Vec<Box<dyn InferenceBackend>> = vec![
        Box::new(ExplicitBackend::new()),
        Box::new(VectorizedBackend::new()),
    ];
    #[cfg(feature = "autodiff")]
    out.push(Box::new(staghunt_core::TensorBackend::new()));
    out
}

fn assert_backend_parity(graph: &FactorGraph, config: &BeliefPropagationConfig) {
    let mut all = backends();
    let (reference, rest) = all.split_first_mut().expect("at least one backend");
    reference.infer(graph, config).expect("reference inference");
    let expected = reference.compute_probabilities(graph).expect("reference beliefs");
    for backend in rest {
        backend.infer(graph, config).expect("inference");
        let actual = backend.compute_probabilities(graph).expect("beliefs");
        assert!(
            expected.allclose(&actual, DEFAULT_RTOL, DEFAULT_ATOL),
            "{} disagrees with {}",
            backend.name(),
            reference.name()
        );
    }
}

fn bench_infer(c: &mut Criterion) {
    let config = BeliefPropagationConfig::default();
    let mut group = c.benchmark_group("infer");
    group.sample_size(10);

    for size in [5usize, 8, 12] {
        let graph = scenario_graph(size, 2);
        assert_backend_parity(&graph, &config);
        group.throughput(Throughput::Elements(graph.num_edges() as u64));

        for mut backend in backends() {
            group.bench_with_input(BenchmarkId::new(backend.name(), size), &graph, |b, graph| {
                b.iter(|| {
                    let diagnostics = backend
                        .infer(black_box(graph), black_box(&config))
                        .expect("inference");
                    black_box(diagnostics.iterations_run);
                });
            });
        }
    }
    group.finish();
}

fn bench_compute_probabilities(c: &mut Criterion) {
    let config = BeliefPropagationConfig::default();
    let graph = scenario_graph(8, 3);
    let mut group = c.benchmark_group("compute_probabilities");
    group.sample_size(20);

    for mut backend in backends() {
        backend.infer(&graph, &config).expect("inference");
        group.bench_function(backend.name(), |b| {
            b.iter(|| {
                let beliefs = backend
                    .compute_probabilities(black_box(&graph))
                    .expect("beliefs");
                black_box(beliefs.var_probabilities().len());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_infer, bench_compute_probabilities);
criterion_main!(benches);
