// crates/templar-pipeline/benches/pipeline_bench.rs
//
// Three Criterion benchmark groups:
//   fingerprint_cold_vs_warm — stat+hash a file vs. a metadata-key cache hit
//   cache_get_set            — LruTtlCache insert/lookup throughput
//   orchestrator_throughput  — end-to-end submit-to-result, cache hit vs miss

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use templar_pipeline::cache::LruTtlCache;
use templar_pipeline::fingerprint::fingerprint;
use templar_pipeline::{ComponentDescriptor, OrchestratorBuilder, PipelineConfig};

fn write_component(dir: &std::path::Path, name: &str) -> Arc<ComponentDescriptor> {
    let path = dir.join(format!("{name}.tmpl"));
    std::fs::write(&path, "x".repeat(4096)).expect("write fixture component");
    Arc::new(ComponentDescriptor {
        name: name.to_string(),
        source_path: path,
        package: "bench".to_string(),
        params: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Group 1: fingerprint_cold_vs_warm
// ---------------------------------------------------------------------------

fn fingerprint_cold_vs_warm(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let descriptor = write_component(dir.path(), "widget");

    let mut group = c.benchmark_group("fingerprint_cold_vs_warm");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("cache_miss_stat_and_hash", |b| {
        b.iter_batched(
            || Arc::new(LruTtlCache::new(16 * 1024 * 1024, Duration::from_secs(300))),
            |cache| black_box(fingerprint(&descriptor, &cache)),
            criterion::BatchSize::SmallInput,
        )
    });

    let warm_cache = Arc::new(LruTtlCache::new(16 * 1024 * 1024, Duration::from_secs(300)));
    let _ = fingerprint(&descriptor, &warm_cache);
    group.bench_function("cache_hit_metadata_key", |b| {
        b.iter(|| black_box(fingerprint(&descriptor, &warm_cache)))
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Group 2: cache_get_set
// ---------------------------------------------------------------------------

fn cache_get_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get_set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set", |b| {
        let cache = LruTtlCache::new(64 * 1024 * 1024, Duration::from_secs(300));
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            cache.set(&format!("key-{counter}"), black_box(vec![0u8; 256]));
        })
    });

    group.bench_function("get_hit", |b| {
        let cache = LruTtlCache::new(64 * 1024 * 1024, Duration::from_secs(300));
        cache.set("steady-key", vec![0u8; 256]);
        b.iter(|| black_box(cache.get("steady-key")))
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Group 3: orchestrator_throughput — submit-to-result latency, cache hit vs miss
// ---------------------------------------------------------------------------

fn orchestrator_throughput(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let descriptor = write_component(dir.path(), "widget");

    let mut group = c.benchmark_group("orchestrator_throughput");
    group.sample_size(20);
    group.warm_up_time(Duration::from_millis(200));
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("submit_cache_miss_distinct_files", |b| {
        let config = PipelineConfig {
            worker_count: 4,
            allowed_commands: vec!["true".to_string()],
            generator_args: Vec::new(),
            ..Default::default()
        };
        let orchestrator = OrchestratorBuilder::new(config).build();
        orchestrator.start().expect("start orchestrator");
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let d = write_component(dir.path(), &format!("fresh-{counter}"));
            orchestrator.submit(d).expect("submit");
        });
        let _ = orchestrator.stop_with_timeout(Duration::from_secs(5));
    });

    group.bench_function("submit_cache_hit_same_file", |b| {
        let config = PipelineConfig {
            worker_count: 1,
            allowed_commands: vec!["true".to_string()],
            generator_args: Vec::new(),
            ..Default::default()
        };
        let orchestrator = OrchestratorBuilder::new(config).build();
        orchestrator.start().expect("start orchestrator");
        orchestrator.submit(Arc::clone(&descriptor)).expect("prime cache");
        // give the single warm-up build a moment to land in the cache.
        let deadline = Instant::now() + Duration::from_secs(2);
        while orchestrator.metrics_snapshot().total_builds == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        b.iter(|| {
            orchestrator.submit(Arc::clone(&descriptor)).expect("submit");
        });
        let _ = orchestrator.stop_with_timeout(Duration::from_secs(5));
    });

    group.finish();
}

criterion_group!(benches_fingerprint, fingerprint_cold_vs_warm);
criterion_group!(benches_cache, cache_get_set);
criterion_group!(benches_orchestrator, orchestrator_throughput);
criterion_main!(benches_fingerprint, benches_cache, benches_orchestrator);
