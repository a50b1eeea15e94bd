//! Benchmarks for series blocks and cursors.
//!
//! Run with: cargo bench --package alopex-series
//!
//! ## Benchmark Categories
//!
//! - **Append**: write path into pooled blocks
//! - **Scan**: forward iteration with key/value and key-only readers
//! - **Seek**: `move_at` lookups across many blocks
//! - **Stride**: `move_by` jumps crossing block boundaries

use alopex_series::{BlockChain, BlockCursor, ChainConfig, KeyOnlyReader, Lookup};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

const ROWS: i64 = 100_000;

/// Builds a series of regular one-second timestamps with slowly varying values.
fn build_series(rows: i64, capacity: usize) -> Arc<BlockChain<i64, f64>> {
    let chain = BlockChain::new(ChainConfig::default().with_block_capacity(capacity));
    let mut value = 50.0;
    for i in 0..rows {
        value += (i as f64 * 0.1).sin() * 0.1;
        chain.append(i * 1_000_000_000, value).unwrap();
    }
    Arc::new(chain)
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(ROWS as u64));
    for capacity in [256usize, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &cap| {
            b.iter(|| build_series(black_box(ROWS), cap))
        });
    }
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let series = build_series(ROWS, 1024);
    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(ROWS as u64));

    group.bench_function("key_value", |b| {
        b.iter(|| {
            let mut cursor = series.cursor();
            let mut sum = 0.0;
            while cursor.move_next().unwrap() {
                sum += cursor.current_value();
            }
            black_box(sum)
        })
    });

    group.bench_function("key_only", |b| {
        b.iter(|| {
            let mut cursor: BlockCursor<i64, f64, KeyOnlyReader> =
                BlockCursor::new(Arc::clone(&series));
            cursor.initialize();
            let mut last = 0;
            while cursor.move_next().unwrap() {
                last = cursor.current_key();
            }
            black_box(last)
        })
    });
    group.finish();
}

fn bench_seek(c: &mut Criterion) {
    let series = build_series(ROWS, 1024);
    let probes: Vec<i64> = (0..1_000).map(|i| (i * 7_919 % ROWS) * 1_000_000_000 + 1).collect();

    let mut group = c.benchmark_group("seek");
    group.throughput(Throughput::Elements(probes.len() as u64));
    for lookup in [Lookup::Eq, Lookup::Le, Lookup::Gt] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{lookup:?}")),
            &lookup,
            |b, &lookup| {
                let mut cursor = series.cursor();
                b.iter(|| {
                    let mut hits = 0;
                    for &probe in &probes {
                        if cursor.move_at(black_box(probe), lookup).unwrap() {
                            hits += 1;
                        }
                    }
                    black_box(hits)
                })
            },
        );
    }
    group.finish();
}

fn bench_stride(c: &mut Criterion) {
    let series = build_series(ROWS, 1024);
    c.bench_function("move_by_stride_1500", |b| {
        let mut cursor = series.cursor();
        b.iter(|| {
            cursor.reset();
            let mut moves = 0;
            while cursor.move_by(black_box(1_500), false).unwrap() != 0 {
                moves += 1;
            }
            black_box(moves)
        })
    });
}

criterion_group!(benches, bench_append, bench_scan, bench_seek, bench_stride);
criterion_main!(benches);
