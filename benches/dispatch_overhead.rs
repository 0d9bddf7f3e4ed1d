//! Dispatcher Benchmarks
//!
//! Cost of moving a call onto the confinement worker and back, compared
//! with running it inline.
//!
//! Run with: `cargo bench --bench dispatch_overhead`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wkbridge::Dispatcher;

fn bench_round_trip(c: &mut Criterion) {
    let dispatcher = Dispatcher::spawn("bench").expect("spawn dispatcher");

    let mut group = c.benchmark_group("dispatch_round_trip");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("inline", |b| {
        b.iter(|| black_box(black_box(21u64) * 2))
    });

    group.bench_function("submit", |b| {
        b.iter(|| {
            let value = black_box(21u64);
            dispatcher.submit(move || value * 2).expect("submit")
        })
    });

    group.bench_function("submit_payload_4k", |b| {
        let payload = vec![7u8; 4096];
        b.iter(|| {
            let payload = payload.clone();
            dispatcher.submit(move || payload.len()).expect("submit")
        })
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let dispatcher = Arc::new(Dispatcher::spawn("bench").expect("spawn dispatcher"));

    let mut group = c.benchmark_group("dispatch_contended");
    group.measurement_time(Duration::from_secs(10));

    for producers in [2usize, 4, 8] {
        let calls_per_producer = 100u64;
        group.throughput(Throughput::Elements(producers as u64 * calls_per_producer));
        group.bench_with_input(BenchmarkId::new("producers", producers), &producers, |b, &producers| {
            b.iter(|| {
                let handles: Vec<_> = (0..producers)
                    .map(|_| {
                        let dispatcher = Arc::clone(&dispatcher);
                        thread::spawn(move || {
                            for i in 0..calls_per_producer {
                                dispatcher.submit(move || black_box(i)).expect("submit");
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().expect("producer thread");
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_contended);
criterion_main!(benches);
