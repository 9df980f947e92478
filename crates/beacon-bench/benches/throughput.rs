//! Throughput benchmarks for Beacon.
//!
//! These benchmarks measure how many events the engine components accept
//! and fan out per second.

use beacon_bench::{event, FanOut, ORG};
use beacon_core::{
    EventPublisher, LocalBroker, MetricSample, MetricsStream, PublisherConfig, StreamConfig,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

fn publisher() -> Arc<EventPublisher> {
    Arc::new(EventPublisher::new(
        Arc::new(LocalBroker::default()),
        PublisherConfig {
            batch_size: usize::MAX,
            ..PublisherConfig::default()
        },
    ))
}

/// Benchmark publisher admission.
fn bench_publish(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("publish");
    group.throughput(Throughput::Elements(1));

    // Every event distinct: dedup miss, queued.
    group.bench_function("unique", |b| {
        b.iter_custom(|iters| {
            let publisher = publisher();
            let start = Instant::now();
            for seq in 0..iters {
                let _ = publisher.publish(black_box(event("org:bench", seq)));
            }
            let elapsed = start.elapsed();
            rt.block_on(publisher.flush());
            elapsed
        });
    });

    // Same payload every time: dedup hit after the first.
    group.bench_function("duplicate", |b| {
        let publisher = publisher();
        b.iter(|| publisher.publish(black_box(event("org:bench", 0))));
    });

    group.bench_function("flush_1000", |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                let publisher = publisher();
                for seq in 0..1000 {
                    let _ = publisher.publish(event("org:bench", seq));
                }
                let start = Instant::now();
                rt.block_on(publisher.flush());
                total += start.elapsed();
            }
            total
        });
    });

    group.finish();
}

/// Benchmark metric ingestion under coalescing.
fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics_stream");
    group.throughput(Throughput::Elements(1));

    for max_update_frequency in [10usize, 1_000_000] {
        let label = if max_update_frequency == 10 {
            "coalescing"
        } else {
            "raw"
        };
        group.bench_function(label, |b| {
            let stream = MetricsStream::new(
                publisher(),
                StreamConfig {
                    max_update_frequency,
                    buffer_size: usize::MAX,
                    aggregation_window: Duration::from_secs(3600),
                    ..StreamConfig::default()
                },
            );
            let mut value = 0.0;
            b.iter(|| {
                value += 1.0;
                stream.stream_metric(black_box(MetricSample::new(ORG, "cpu.load", value)))
            });
        });
    }

    group.bench_function("flush_100_metrics", |b| {
        let stream = MetricsStream::new(publisher(), StreamConfig::default());
        b.iter(|| {
            for i in 0..100 {
                let _ = stream.stream_metric(MetricSample::new(ORG, format!("metric.{i}"), 1.0));
            }
            stream.flush()
        });
    });

    group.finish();
}

/// Benchmark fan-out to room members.
fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout");

    for size in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut fanout = rt.block_on(FanOut::new(size));
            let mut seq = 0u64;
            b.iter(|| {
                seq += 1;
                // Backlogs are spawned onto the runtime
                let report = rt.block_on(async {
                    fanout
                        .subscriber
                        .deliver(Arc::new(event(&fanout.room, seq)))
                });
                fanout.drain();
                report
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_publish, bench_stream, bench_fanout);
criterion_main!(benches);
