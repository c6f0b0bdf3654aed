//! Masking and path exclusion benchmarks
//!
//! Measures the per-request cost paid on the worker side.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rustapi_telemetry::{FieldMasker, PathMatcher};
use serde_json::json;

fn body_with_items(items: usize) -> Bytes {
    let users: Vec<_> = (0..items)
        .map(|i| {
            json!({
                "id": i,
                "email": format!("user{i}@example.com"),
                "password": "hunter2",
                "profile": {"api_key": "live_abc", "bio": "lorem ipsum dolor sit amet"},
            })
        })
        .collect();
    Bytes::from(serde_json::to_vec(&json!({ "users": users })).unwrap_or_default())
}

/// Benchmark body masking against body size
fn bench_masking(c: &mut Criterion) {
    let mut group = c.benchmark_group("masking");
    let masker = FieldMasker::from_keywords(["password", "api_key", "secret.*"], false);

    for items in [1usize, 10, 100, 1000] {
        let body = body_with_items(items);
        group.bench_with_input(BenchmarkId::new("json_items", items), &body, |b, body| {
            b.iter(|| masker.mask(black_box(body.clone())))
        });
    }

    // Nothing to redact: returns the input untouched
    let clean = Bytes::from_static(br#"{"id":1,"name":"Ada","tags":["a","b","c"]}"#);
    group.bench_function("no_match", |b| {
        b.iter(|| masker.mask(black_box(clean.clone())))
    });

    // Not JSON at all
    let text = Bytes::from(vec![b'x'; 4096]);
    group.bench_function("non_json", |b| b.iter(|| masker.mask(black_box(text.clone()))));

    group.finish();
}

/// Benchmark path exclusion lookups
fn bench_path_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_matching");

    for count in [1usize, 10, 50] {
        let matcher = PathMatcher::new((0..count).map(|i| format!("/internal/svc{i}/*")));
        group.bench_with_input(BenchmarkId::new("miss", count), &matcher, |b, m| {
            b.iter(|| m.is_excluded(black_box("/api/v1/users/42")))
        });
        group.bench_with_input(BenchmarkId::new("hit_last", count), &matcher, |b, m| {
            let path = format!("/internal/svc{}/metrics", count - 1);
            b.iter(|| m.is_excluded(black_box(&path)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_masking, bench_path_matching);
criterion_main!(benches);
