//! Benchmarks for PMA operations against `BTreeMap`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pma_tree::Pma;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// Keys `1..=n` in doubling batches (128, 128, 256, 512, ...), each batch
/// shuffled on its own: the key space grows roughly in order while every
/// batch arrives in random order.
fn batched_keys(n: usize) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut keys = Vec::with_capacity(n);
    let mut batch = 128usize;
    let mut next = 1i64;
    while keys.len() < n {
        let take = batch.min(n - keys.len());
        let mut chunk: Vec<i64> = (next..next + take as i64).collect();
        chunk.shuffle(&mut rng);
        keys.extend(chunk);
        next += take as i64;
        if keys.len() > 128 {
            batch *= 2;
        }
    }
    keys
}

fn build_pma(keys: &[i64]) -> Pma {
    let mut pma = Pma::new().unwrap();
    for &k in keys {
        pma.insert(k, k * 10).unwrap();
    }
    pma
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [10_000, 100_000, 1_000_000] {
        let keys = batched_keys(size);

        group.bench_with_input(BenchmarkId::new("Pma", size), &keys, |b, keys| {
            b.iter(|| black_box(build_pma(keys)));
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &keys, |b, keys| {
            b.iter(|| {
                let mut map = BTreeMap::new();
                for &k in keys {
                    map.insert(k, k * 10);
                }
                black_box(map)
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for size in [10_000, 100_000, 1_000_000] {
        let keys = batched_keys(size);
        let pma = build_pma(&keys);
        let btree: BTreeMap<i64, i64> = keys.iter().map(|&k| (k, k * 10)).collect();

        let mut probes = keys.clone();
        probes.shuffle(&mut StdRng::seed_from_u64(7));
        probes.truncate(10_000);

        group.bench_with_input(BenchmarkId::new("Pma", size), &probes, |b, probes| {
            b.iter(|| {
                let mut sum = 0i64;
                for &k in probes {
                    if let Some(v) = pma.get(k) {
                        sum = sum.wrapping_add(v);
                    }
                }
                black_box(sum)
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &probes, |b, probes| {
            b.iter(|| {
                let mut sum = 0i64;
                for k in probes {
                    if let Some(v) = btree.get(k) {
                        sum = sum.wrapping_add(*v);
                    }
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_range_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_sum");
    let size = 1_000_000;
    let keys = batched_keys(size);
    let pma = build_pma(&keys);
    let btree: BTreeMap<i64, i64> = keys.iter().map(|&k| (k, k * 10)).collect();

    for length in [100i64, 10_000, 1_000_000] {
        let start = 1;
        let end = start + length - 1;

        group.bench_with_input(BenchmarkId::new("Pma", length), &(start, end), |b, &(s, e)| {
            b.iter(|| black_box(pma.range_sum(s, e)));
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", length), &(start, end), |b, &(s, e)| {
            b.iter(|| {
                let (mut keys, mut values) = (0i64, 0i64);
                for (&k, &v) in btree.range(s..=e) {
                    keys = keys.wrapping_add(k);
                    values = values.wrapping_add(v);
                }
                black_box((keys, values))
            });
        });
    }

    group.finish();
}

fn bench_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove");
    let size = 100_000;
    let keys = batched_keys(size);
    let mut victims = keys.clone();
    victims.shuffle(&mut StdRng::seed_from_u64(11));
    victims.truncate(size / 10);

    group.bench_function(BenchmarkId::new("Pma", size), |b| {
        b.iter_batched(
            || build_pma(&keys),
            |mut pma| {
                for &k in &victims {
                    pma.remove(k);
                }
                black_box(pma)
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_lookup, bench_range_sum, bench_remove);
criterion_main!(benches);
