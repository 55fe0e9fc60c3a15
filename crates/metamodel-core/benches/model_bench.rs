use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use metamodel_core::{CellInteraction, Model, ModelConfig};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn bench_model_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_step");
    group.sample_size(env_or("MM_BENCH_SAMPLES", 20usize).max(10));
    group.warm_up_time(Duration::from_secs(env_or("MM_BENCH_WARMUP_SECS", 2)));
    group.measurement_time(Duration::from_secs(env_or("MM_BENCH_MEASURE_SECS", 8)));
    let steps: u64 = env_or("MM_BENCH_STEPS", 16);
    let partitions_list: Vec<u32> = std::env::var("MM_BENCH_PARTITIONS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<u32>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![1, 4, 8]);
    for &partitions in &partitions_list {
        group.bench_function(format!("steps{steps}_partitions{partitions}"), |b| {
            b.iter_batched(
                || {
                    let config = ModelConfig {
                        grid_width: 64,
                        grid_height: 64,
                        partitions,
                        occupation_rate: 0.4,
                        rng_seed: Some(0xBEEF),
                        cell_interactions: CellInteraction::ReadAllWriteOne,
                        dynamic_cell_edge_weights: true,
                        history_capacity: 1,
                        ..ModelConfig::default()
                    };
                    Model::new(config).expect("model")
                },
                |mut model| {
                    model.run(steps).expect("run");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_model_steps);
criterion_main!(benches);
