//! Benchmarks for the hot paths of the orchestration components

use benchflow::batch::{BatchProcessor, Task};
use benchflow::config::{BatchConfig, DecisionConfig, PoolConfig};
use benchflow::decision::{
    default_criteria, generate_options, DecisionContext, DecisionEngine, DecisionType,
    Evaluation, PatternBook, StrategyKind,
};
use benchflow::pipeline::DependencyGraph;
use benchflow::resource::ResourcePool;
use benchflow::runner::{FnRunner, TaskRunner};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn loaded_context() -> DecisionContext {
    DecisionContext::new()
        .with_metric("success_rate", 0.82)
        .with_metric("average_duration_ms", 1_250.0)
        .with_resource_status("utilization", 0.74)
        .with_system_load(0.68)
        .with_error("timeout waiting for agent")
}

/// Layered graph: `layers` waves of `width` nodes, each depending on the whole
/// previous layer
fn layered_nodes(layers: usize, width: usize) -> Vec<(String, Vec<String>)> {
    let mut nodes = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for i in 0..width {
            let deps = if layer == 0 {
                Vec::new()
            } else {
                (0..width).map(|j| format!("n{}-{}", layer - 1, j)).collect()
            };
            nodes.push((format!("n{layer}-{i}"), deps));
        }
    }
    nodes
}

fn bench_strategy_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("strategy_evaluation");
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(5));

    let context = loaded_context();
    let patterns = PatternBook::default();

    for kind in StrategyKind::ALL {
        group.bench_with_input(
            BenchmarkId::new("all_decision_types", kind.as_str()),
            &kind,
            |b, kind| {
                let strategy = kind.strategy();
                b.iter(|| {
                    for decision_type in DecisionType::ALL {
                        let options = generate_options(decision_type, &context);
                        let criteria = default_criteria(decision_type);
                        let eval = Evaluation {
                            criteria: &criteria,
                            context: &context,
                            patterns: &patterns,
                        };
                        black_box(strategy.evaluate_options(&options, &eval));
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_engine_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_decide");
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(5));

    let context = loaded_context();

    group.bench_function("error_recovery_with_history", |b| {
        let engine = DecisionEngine::new(DecisionConfig {
            default_strategy: StrategyKind::Adaptive,
            ..DecisionConfig::default()
        });
        b.iter(|| {
            black_box(engine.decide(
                black_box(DecisionType::ErrorRecovery),
                &context,
                None,
            ))
        });
    });

    group.finish();
}

fn bench_dependency_waves(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_waves");
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(5));

    for (layers, width) in [(4, 4), (10, 10), (25, 20)] {
        let nodes = layered_nodes(layers, width);
        group.bench_with_input(
            BenchmarkId::new("build_and_waves", layers * width),
            &nodes,
            |b, nodes| {
                b.iter(|| {
                    let graph = DependencyGraph::build(
                        "bench",
                        nodes.iter().map(|(name, deps)| (name.as_str(), deps.as_slice())),
                    )
                    .unwrap();
                    black_box(graph.waves())
                });
            },
        );
    }

    group.finish();
}

fn bench_batch_processing(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("batch_processing");
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(5));

    for size in [10usize, 100] {
        group.bench_with_input(BenchmarkId::new("instant_tasks", size), &size, |b, &size| {
            b.to_async(&rt).iter_batched(
                || {
                    let pool = Arc::new(ResourcePool::new(PoolConfig::default()).unwrap());
                    let runner: Arc<dyn TaskRunner> = Arc::new(FnRunner::new(
                        |task: Task| async move { Ok(json!({"id": task.id})) },
                    ));
                    let processor = BatchProcessor::new(BatchConfig::default(), pool, runner).unwrap();
                    let tasks: Vec<Task> = (0..size)
                        .map(|i| Task::new(format!("task-{i}"), "eval", json!({"n": i})))
                        .collect();
                    (processor, tasks)
                },
                |(processor, tasks)| async move {
                    black_box(processor.process_batch(tasks, None).await.unwrap())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_strategy_evaluation,
    bench_engine_decide,
    bench_dependency_waves,
    bench_batch_processing
);
criterion_main!(benches);
