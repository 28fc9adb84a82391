//! Benchmarks for the per-row transform primitives
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mct_core::LineBuf;
use mct_transform::ycc;

fn bench_reversible_colour(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reversible colour transform");
    for width in [256usize, 4096] {
        let r: Vec<i16> = (0..width).map(|n| (n % 256) as i16).collect();
        let g: Vec<i16> = (0..width).map(|n| ((n * 3) % 256) as i16).collect();
        let b: Vec<i16> = (0..width).map(|n| ((n * 7) % 256) as i16).collect();

        group.bench_function(BenchmarkId::new("forward", width), |bench| {
            bench.iter(|| {
                let (mut r, mut g, mut b) = (r.clone(), g.clone(), b.clone());
                ycc::rgb_to_ycc_rev16(
                    black_box(&mut r),
                    black_box(&mut g),
                    black_box(&mut b),
                );
            });
        });
        group.bench_function(BenchmarkId::new("inverse", width), |bench| {
            bench.iter(|| {
                let (mut y, mut cb, mut cr) = (r.clone(), g.clone(), b.clone());
                ycc::ycc_to_rgb_rev16(
                    black_box(&mut y),
                    black_box(&mut cb),
                    black_box(&mut cr),
                );
            });
        });
    }
    group.finish();
}

fn bench_irreversible_colour(c: &mut Criterion) {
    let mut group = c.benchmark_group("Irreversible colour transform");
    let width = 4096;
    let mut c0 = LineBuf::new(width, false, false);
    let mut c1 = LineBuf::new(width, false, false);
    let mut c2 = LineBuf::new(width, false, false);
    c0.fill_float(0.25);
    c1.fill_float(-0.125);
    c2.fill_float(0.0625);

    group.bench_function("forward_f32", |bench| {
        bench.iter(|| {
            ycc::rgb_to_ycc(black_box(&mut c0), black_box(&mut c1), black_box(&mut c2));
        });
    });
    group.bench_function("inverse_f32", |bench| {
        bench.iter(|| {
            ycc::ycc_to_rgb(black_box(&mut c0), black_box(&mut c1), black_box(&mut c2));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_reversible_colour, bench_irreversible_colour);
criterion_main!(benches);
