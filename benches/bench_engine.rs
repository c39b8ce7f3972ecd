//! Micro benchmarks for override resolution and admission against the
//! in-memory store. Pure CPU - no network.
//!
//! ```bash
//! cargo bench --bench bench_engine
//! ```

use std::collections::BTreeMap;
use std::hint::black_box;
use std::sync::Arc;

use bucketdb_lib::bucket::{build_bucket, resolve};
use bucketdb_lib::{BucketDb, BucketRequest, BucketSpec, MemoryStore};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;

const NOW_MS: u64 = 1_700_000_000_000;

/// A bucket type with 50 exact and 20 regex overrides
fn bucket_spec() -> BucketSpec {
    let mut overrides = serde_json::Map::new();
    for i in 0..50 {
        overrides.insert(format!("10.0.0.{i}"), json!({ "per_second": 100 }));
    }
    for i in 0..20 {
        overrides.insert(
            format!("range-{i:02}"),
            json!({ "match": format!("^172\\.{i}\\."), "per_second": 50 }),
        );
    }
    let spec = json!({ "size": 10, "per_second": 5, "overrides": overrides });
    match serde_json::from_value(spec) {
        Ok(spec) => spec,
        Err(e) => panic!("benchmark bucket spec is invalid: {e}"),
    }
}

fn bench_resolve(c: &mut Criterion) {
    let bucket = match build_bucket("ip", &bucket_spec(), NOW_MS) {
        Ok(bucket) => bucket,
        Err(e) => panic!("failed to build benchmark bucket: {e}"),
    };

    c.bench_function("resolve_exact_override", |b| {
        b.iter(|| resolve(&bucket, black_box("10.0.0.42"), None));
    });
    // the first lookup fills the match cache; later ones are cache hits
    c.bench_function("resolve_regex_override_cached", |b| {
        b.iter(|| resolve(&bucket, black_box("172.19.0.1"), None));
    });
    c.bench_function("resolve_no_override", |b| {
        b.iter(|| resolve(&bucket, black_box("8.8.4.4"), None));
    });
}

fn bench_take(c: &mut Criterion) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => panic!("failed to build runtime: {e}"),
    };
    let mut buckets = BTreeMap::new();
    buckets.insert("ip".to_string(), bucket_spec());
    let db = match BucketDb::builder(Arc::new(MemoryStore::default())).buckets(buckets).build() {
        Ok(db) => db,
        Err(e) => panic!("failed to build engine: {e}"),
    };

    let hot = BucketRequest::new("ip", "10.0.0.7");
    c.bench_function("take_single_key", |b| {
        b.iter(|| rt.block_on(db.take(black_box(&hot))));
    });

    let keys: Vec<BucketRequest> = (0..1024)
        .map(|i| BucketRequest::new("ip", format!("192.0.{}.{}", i / 256, i % 256)))
        .collect();
    let mut next = 0usize;
    c.bench_function("take_spread_keys", |b| {
        b.iter(|| {
            next = (next + 1) % keys.len();
            rt.block_on(db.take(black_box(&keys[next])))
        });
    });
}

criterion_group!(benches, bench_resolve, bench_take);
criterion_main!(benches);
