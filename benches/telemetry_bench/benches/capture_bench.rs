//! Body capture benchmarks
//!
//! Capture runs on the request path, so its cost is added to every
//! observed exchange.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rustapi_telemetry::{CaptureBuffer, CaptureWriter, SharedCapture};
use std::io::Write;

const CAP: usize = 64 * 1024;

/// Benchmark buffering a body split into chunks, under and over the cap
fn bench_capture_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture_buffer");
    let chunk = vec![b'a'; 8 * 1024];

    for chunks in [1usize, 8, 64] {
        group.throughput(Throughput::Bytes((chunks * chunk.len()) as u64));
        group.bench_with_input(BenchmarkId::new("chunks", chunks), &chunks, |b, &n| {
            b.iter(|| {
                let mut buf = CaptureBuffer::new(CAP);
                for _ in 0..n {
                    buf.write(black_box(&chunk));
                }
                buf.total_bytes()
            })
        });
    }

    group.finish();
}

/// Benchmark the shared tap used by the middleware
fn bench_shared_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_capture");
    let chunk = vec![b'a'; 4 * 1024];

    group.bench_function("record_and_take", |b| {
        b.iter(|| {
            let capture = SharedCapture::new(CAP);
            for _ in 0..16 {
                capture.record(black_box(&chunk));
            }
            capture.take()
        })
    });

    group.finish();
}

/// Benchmark the blocking writer tap
fn bench_capture_writer(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture_writer");
    let chunk = vec![b'a'; 4 * 1024];

    group.bench_function("write_64k", |b| {
        b.iter(|| {
            let mut writer = CaptureWriter::new(Vec::with_capacity(CAP), CAP);
            for _ in 0..16 {
                let _ = writer.write_all(black_box(&chunk));
            }
            writer.into_parts()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_capture_buffer,
    bench_shared_capture,
    bench_capture_writer
);
criterion_main!(benches);
