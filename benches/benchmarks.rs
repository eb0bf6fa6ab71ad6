//! Performance Benchmarks for Meta Multi-Task Training
//!
//! Run with: cargo bench
//!
//! Benchmarks cover:
//! - Simulated inner steps and exact meta-gradients
//! - Alignment regularizers of the approximation
//! - Batch streaming and metric tracking
//! - Config serialization

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use metatrain::aggregate::AlignmentConfig;
use metatrain::dataset::BatchStream;
use metatrain::tracker::check_history;
use metatrain::{
    alignment_regularizer, simulate_sgd, ApproxTerm, Dataset, MetaGradientEngine, MetaModel,
    MetricKind, MlpConfig, MultiTaskMlp, SharedParams, Task, TaskKind, TrainerConfig,
};

fn bench_tasks(dim: usize, device: &Device) -> Vec<Task> {
    let reg = Dataset::synthetic_regression(64, dim, 1, device).unwrap();
    let cls = Dataset::synthetic_classification(64, dim, 3, 2, device).unwrap();
    vec![
        Task::new("sts", TaskKind::Regression, MetricKind::Mse, reg.clone(), reg).unwrap(),
        Task::new(
            "nli",
            TaskKind::Classification { n_classes: 3 },
            MetricKind::Accuracy,
            cls.clone(),
            cls,
        )
        .unwrap(),
    ]
}

// ═══════════════════════════════════════════════════════════════════════════
// META-GRADIENT BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_simulated_step(c: &mut Criterion) {
    let device = Device::Cpu;
    let tasks = bench_tasks(16, &device);

    let mut group = c.benchmark_group("simulated_step");
    for hidden in [16, 64, 128].iter() {
        let config = MlpConfig {
            input_dim: 16,
            hidden_dim: *hidden,
            n_layers: 2,
        };
        let model = MultiTaskMlp::new(&config, &tasks, &device).unwrap();
        let shared = SharedParams::from_exclusion_rule(model.parameters());
        let batch = tasks[0].train_data().gather(&(0..32).collect::<Vec<_>>()).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(hidden), hidden, |b, _| {
            b.iter(|| simulate_sgd(&model, &shared, &tasks[0], black_box(&batch), 1e-3).unwrap())
        });
    }
    group.finish();
}

fn bench_exact_meta_gradient(c: &mut Criterion) {
    let device = Device::Cpu;
    let tasks = bench_tasks(16, &device);

    let mut group = c.benchmark_group("exact_meta_gradient");
    for hidden in [16, 64, 128].iter() {
        let config = MlpConfig {
            input_dim: 16,
            hidden_dim: *hidden,
            n_layers: 2,
        };
        let model = MultiTaskMlp::new(&config, &tasks, &device).unwrap();
        let shared = SharedParams::from_exclusion_rule(model.parameters());
        let engine = MetaGradientEngine::new(model.parameters()).unwrap();
        let ids: Vec<usize> = (0..32).collect();
        let src_batch = tasks[0].train_data().gather(&ids).unwrap();
        let trg_batch = tasks[1].train_data().gather(&ids).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(hidden), hidden, |b, _| {
            b.iter(|| {
                engine
                    .compute(
                        &model,
                        &shared,
                        (&tasks[0], black_box(&src_batch)),
                        (&tasks[1], black_box(&trg_batch)),
                        1e-3,
                    )
                    .unwrap()
            })
        });
    }
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// APPROXIMATION BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_alignment_regularizer(c: &mut Criterion) {
    let device = Device::Cpu;

    let mut group = c.benchmark_group("alignment_regularizer");
    for size in [1_000, 10_000, 100_000].iter() {
        let g1 = Tensor::randn(0.0f32, 1.0, *size, &device).unwrap();
        let g2 = Tensor::randn(0.0f32, 1.0, *size, &device).unwrap();
        let config = AlignmentConfig {
            term: ApproxTerm::DotProduct,
            only_pos_reg: false,
            max_sim_grad_norm: Some(5.0),
        };

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &(g1, g2), |b, (g1, g2)| {
            b.iter(|| alignment_regularizer(black_box(g1), black_box(g2), &config).unwrap())
        });
    }
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// BOOKKEEPING BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_batch_stream(c: &mut Criterion) {
    let device = Device::Cpu;
    let data = Dataset::synthetic_regression(4096, 16, 3, &device).unwrap();
    let mut stream = BatchStream::new(data, 32, true, 7).unwrap();

    c.bench_function("batch_stream_next", |b| {
        b.iter(|| stream.next_batch().unwrap())
    });
}

fn bench_history_check(c: &mut Criterion) {
    let hist: Vec<f64> = (0..200).map(|i| ((i * 37) % 101) as f64 / 100.0).collect();

    c.bench_function("history_check", |b| {
        b.iter(|| check_history(black_box(&hist), false, black_box(5)))
    });
}

fn bench_config_serialization(c: &mut Criterion) {
    let config = TrainerConfig::default();
    let json = serde_json::to_string(&config).unwrap();

    c.bench_function("config_to_json", |b| {
        b.iter(|| serde_json::to_string(black_box(&config)).unwrap())
    });
    c.bench_function("config_from_json", |b| {
        b.iter(|| serde_json::from_str::<TrainerConfig>(black_box(&json)).unwrap())
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// CRITERION GROUPS
// ═══════════════════════════════════════════════════════════════════════════

criterion_group!(
    meta_gradient_benches,
    bench_simulated_step,
    bench_exact_meta_gradient,
);

criterion_group!(
    approx_benches,
    bench_alignment_regularizer,
);

criterion_group!(
    bookkeeping_benches,
    bench_batch_stream,
    bench_history_check,
    bench_config_serialization,
);

criterion_main!(
    meta_gradient_benches,
    approx_benches,
    bookkeeping_benches,
);
