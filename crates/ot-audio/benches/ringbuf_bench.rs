//! Throughput benchmarks for the driver-boundary frame ring.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ot_audio::FrameRingBuffer;

fn bench_ring_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_ring");

    for &block in &[64usize, 256, 1024] {
        group.throughput(Throughput::Elements(block as u64));
        group.bench_with_input(BenchmarkId::new("write_read", block), &block, |b, &block| {
            let ring = FrameRingBuffer::new(block * 4, 2);
            let left = vec![0.25f32; block];
            let right = vec![-0.25f32; block];
            let mut out_l = vec![0.0f32; block];
            let mut out_r = vec![0.0f32; block];

            b.iter(|| {
                let written = ring.write(block, &[&left, &right]);
                let read = ring.read(block, &mut [&mut out_l, &mut out_r]);
                black_box((written, read));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ring_write_read);
criterion_main!(benches);
