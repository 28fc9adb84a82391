//! End-to-end throughput of the processing facades
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use mct::{
    CompressionMode, ComponentDescription, DefaultAllocator, DependencySignal, LineBuf,
    MultiAnalysis, MultiSynthesis, NetworkConfig, OutputDescription, RowSink, RowSource,
    TileDescription,
};

struct PatternSource {
    next: i32,
}

impl RowSource for PatternSource {
    fn pull(&mut self, row: &mut LineBuf, _signal: &dyn DependencySignal) {
        row.fill_int(self.next & 0xff);
        self.next += 1;
    }
}

struct NullSink;

impl RowSink for NullSink {
    fn push(&mut self, _row: &mut LineBuf, _signal: &dyn DependencySignal) {}
}

fn colour_tile(width: i32, height: i32) -> TileDescription {
    TileDescription {
        components: (0..3)
            .map(|comp_idx| ComponentDescription {
                comp_idx,
                width,
                height,
                bit_depth: 8,
                mode: CompressionMode::Reversible,
            })
            .collect(),
        outputs: (0..3)
            .map(|_| OutputDescription {
                width,
                height,
                bit_depth: 8,
                signed: false,
            })
            .collect(),
        stages: Vec::new(),
        use_ycc: true,
    }
}

fn bench_synthesis(c: &mut Criterion) {
    let (width, height) = (512, 16);
    let mut group = c.benchmark_group("Synthesis pipeline");
    group.throughput(Throughput::Elements(3 * width as u64 * height as u64));
    group.bench_function("ycc_512x16x3", |bench| {
        bench.iter(|| {
            let sources = (0..3)
                .map(|n| Box::new(PatternSource { next: n }) as Box<dyn RowSource>)
                .collect();
            let mut alloc = DefaultAllocator::new();
            let mut synthesis = MultiSynthesis::create(
                &colour_tile(width, height),
                &NetworkConfig::default(),
                sources,
                None,
                None,
                &mut alloc,
            )
            .unwrap();
            for _row in 0..height {
                for comp in 0..3 {
                    synthesis.get_line(comp).unwrap();
                }
            }
        });
    });
    group.finish();
}

fn bench_analysis(c: &mut Criterion) {
    let (width, height) = (512, 16);
    let mut group = c.benchmark_group("Analysis pipeline");
    group.throughput(Throughput::Elements(3 * width as u64 * height as u64));
    group.bench_function("ycc_512x16x3", |bench| {
        bench.iter(|| {
            let sinks = (0..3)
                .map(|_| Box::new(NullSink) as Box<dyn RowSink>)
                .collect();
            let mut alloc = DefaultAllocator::new();
            let mut analysis = MultiAnalysis::create(
                &colour_tile(width, height),
                &NetworkConfig::default(),
                sinks,
                None,
                None,
                &mut alloc,
            )
            .unwrap();
            for row in 0..height {
                for comp in 0..3 {
                    let buf = analysis.exchange_line(comp, false).unwrap();
                    buf.fill_int(row + comp as i32);
                    let _ = analysis.exchange_line(comp, true);
                }
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_synthesis, bench_analysis);
criterion_main!(benches);
