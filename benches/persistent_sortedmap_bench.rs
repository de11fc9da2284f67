//! Benchmark for `PersistentSortedMap` vs standard `BTreeMap`.
//!
//! Compares persimm's `PersistentSortedMap` against Rust's standard
//! `BTreeMap` for common operations.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use persimm::persistent::PersistentSortedMap;
use std::collections::BTreeMap;
use std::hint::black_box;

// =============================================================================
// insert Benchmark
// =============================================================================

fn benchmark_insert(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("insert");

    for size in [100_i64, 1000, 10000] {
        group.bench_with_input(
            BenchmarkId::new("PersistentSortedMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = PersistentSortedMap::new();
                    for key in 0..size {
                        map = map.insert(black_box(key), key);
                    }
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("BTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = BTreeMap::new();
                    for key in 0..size {
                        map.insert(black_box(key), key);
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// get Benchmark
// =============================================================================

fn benchmark_get(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("get");

    for size in [100_i64, 1000, 10000] {
        let persistent_map: PersistentSortedMap<i64, i64> =
            (0..size).map(|key| (key, key)).collect();
        let standard_map: BTreeMap<i64, i64> = (0..size).map(|key| (key, key)).collect();

        group.bench_with_input(
            BenchmarkId::new("PersistentSortedMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut total = 0;
                    for key in 0..size {
                        total += persistent_map.get(black_box(&key)).copied().unwrap_or(0);
                    }
                    black_box(total)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("BTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut total = 0;
                    for key in 0..size {
                        total += standard_map.get(black_box(&key)).copied().unwrap_or(0);
                    }
                    black_box(total)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// iterate Benchmark
// =============================================================================

fn benchmark_iterate(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("iterate");

    for size in [100_i64, 1000, 10000] {
        let persistent_map: PersistentSortedMap<i64, i64> =
            (0..size).map(|key| (key, key)).collect();
        let standard_map: BTreeMap<i64, i64> = (0..size).map(|key| (key, key)).collect();

        group.bench_with_input(
            BenchmarkId::new("PersistentSortedMap", size),
            &size,
            |bencher, _| {
                bencher.iter(|| {
                    let total: i64 = persistent_map.values().sum();
                    black_box(total)
                });
            },
        );

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &size, |bencher, _| {
            bencher.iter(|| {
                let total: i64 = standard_map.values().sum();
                black_box(total)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_insert, benchmark_get, benchmark_iterate);
criterion_main!(benches);
