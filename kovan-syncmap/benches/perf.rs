//! Benchmark: kovan-syncmap performance
//!
//! Measures the lock-free read path, the buffered write path and the cost of
//! promotions on their own.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kovan_syncmap::SyncMap;
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

// Number of operations per benchmark
const SMALL_OPS: usize = 1_000;
const MEDIUM_OPS: usize = 10_000;
const LARGE_OPS: usize = 100_000;

// Thread counts to test
const THREAD_COUNTS: &[usize] = &[1, 2, 4, 8];

fn populated(size: usize) -> SyncMap<usize, usize> {
    let map: SyncMap<usize, usize> = (0..size).map(|i| (i, i * 2)).collect();
    // Promote everything so reads stay on the snapshot.
    map.range(|_, _| true);
    map
}

/// Benchmark: Single-threaded put of fresh keys (buffered path)
fn bench_single_thread_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_put");

    for &size in &[SMALL_OPS, MEDIUM_OPS, LARGE_OPS] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("fresh_keys", size), &size, |b, &size| {
            b.iter(|| {
                let map = SyncMap::new();
                for i in 0..size {
                    map.put(black_box(i), black_box(i * 2));
                }
                map
            });
        });
        group.bench_with_input(BenchmarkId::new("overwrite", size), &size, |b, &size| {
            let map = populated(size);
            b.iter(|| {
                for i in 0..size {
                    map.put(black_box(i), black_box(i));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: Single-threaded get on published keys
fn bench_single_thread_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_get");

    for &size in &[SMALL_OPS, MEDIUM_OPS, LARGE_OPS] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("hit", size), &size, |b, &size| {
            let map = populated(size);
            b.iter(|| {
                let mut sum = 0;
                for i in 0..size {
                    if let Some(v) = map.get(&black_box(i)) {
                        sum += v;
                    }
                }
                sum
            });
        });
        group.bench_with_input(BenchmarkId::new("miss", size), &size, |b, &size| {
            let map = populated(size);
            b.iter(|| {
                let mut found = 0;
                for i in size..size * 2 {
                    if map.get(&black_box(i)).is_some() {
                        found += 1;
                    }
                }
                found
            });
        });
    }

    group.finish();
}

/// Benchmark: Concurrent reads of a stable key set
fn bench_concurrent_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_get");
    group.sample_size(20);

    for &threads in THREAD_COUNTS {
        let ops_per_thread = MEDIUM_OPS;
        group.throughput(Throughput::Elements((ops_per_thread * threads) as u64));

        group.bench_with_input(
            BenchmarkId::new("syncmap", threads),
            &(threads, ops_per_thread),
            |b, &(threads, ops)| {
                let map = Arc::new(populated(MEDIUM_OPS));
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let map = Arc::clone(&map);
                            thread::spawn(move || {
                                let mut sum = 0;
                                for i in 0..ops {
                                    if let Some(v) = map.get(&black_box(i)) {
                                        sum += v;
                                    }
                                }
                                sum
                            })
                        })
                        .collect();
                    handles.into_iter().map(|h| h.join().unwrap()).sum::<usize>()
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Threads writing disjoint key sets
fn bench_disjoint_writers(c: &mut Criterion) {
    let mut group = c.benchmark_group("disjoint_writers");
    group.sample_size(20);

    for &threads in THREAD_COUNTS {
        let ops_per_thread = MEDIUM_OPS / threads;
        group.throughput(Throughput::Elements((ops_per_thread * threads) as u64));

        group.bench_with_input(
            BenchmarkId::new("syncmap", threads),
            &(threads, ops_per_thread),
            |b, &(threads, ops)| {
                let map = Arc::new(populated(ops * threads));
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            let map = Arc::clone(&map);
                            thread::spawn(move || {
                                for i in 0..ops {
                                    let key = t * ops + i;
                                    map.put(black_box(key), black_box(i));
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Cache fill with load_or_store, then hits
fn bench_load_or_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_or_store");
    group.throughput(Throughput::Elements(MEDIUM_OPS as u64));

    group.bench_function("fill_then_hit", |b| {
        b.iter(|| {
            let map = SyncMap::new();
            for round in 0..4 {
                for i in 0..MEDIUM_OPS / 4 {
                    black_box(map.load_or_store(i, round));
                }
            }
            map
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_put,
    bench_single_thread_get,
    bench_concurrent_get,
    bench_disjoint_writers,
    bench_load_or_store
);
criterion_main!(benches);
