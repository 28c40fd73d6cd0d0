use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use voice_pipeline::audio::buffer::RingBuffer;
use voice_pipeline::audio::format::to_pcm16_bytes;

fn enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");

    for chunk in [480usize, 960, 1920] {
        let buffer = RingBuffer::new(48000, 1, 2.0);
        let samples = vec![0.25f32; chunk];
        let mut out = Vec::with_capacity(chunk);

        group.throughput(Throughput::Elements(chunk as u64));
        group.bench_with_input(BenchmarkId::new("enqueue_dequeue", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                buffer.enqueue(black_box(&samples));
                buffer.dequeue_into(&mut out, chunk);
                black_box(&out);
            })
        });
    }

    // Producer outrunning the consumer: every enqueue overwrites
    let full = RingBuffer::with_capacity(4096);
    full.enqueue(&vec![0.0; 4096]);
    let samples = vec![0.5f32; 960];
    group.throughput(Throughput::Elements(960));
    group.bench_function("enqueue_overwrite", |b| {
        b.iter(|| full.enqueue(black_box(&samples)))
    });

    group.finish();
}

fn pcm_conversion(c: &mut Criterion) {
    let samples: Vec<f32> = (0..960).map(|i| ((i as f32) * 0.01).sin()).collect();
    c.bench_function("to_pcm16_bytes_960", |b| b.iter(|| to_pcm16_bytes(black_box(&samples))));
}

criterion_group!(benches, enqueue_dequeue, pcm_conversion);
criterion_main!(benches);
