//! Shared test helpers for engine tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bucketdb_lib::{BucketDb, BucketSpec, ManualClock, MemoryStore};
use serde_json::{json, Value};

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// 2023-11-14T22:13:20Z
pub const START_MS: u64 = 1_700_000_000_000;

pub const PREFIX: &str = "tests:";

/// Bucket types exercised by most engine tests
pub fn default_buckets() -> Value {
    let yesterday = START_MS as i64 - 24 * 3_600_000 - 60_000;
    json!({
        "ip": {
            "size": 10,
            "per_second": 5,
            "overrides": {
                "127.0.0.1": { "per_second": 100 },
                "local-lan": { "match": "192\\.168\\.", "per_second": 50 },
                "10.0.0.123": { "until": "2023-11-13T22:12:20Z", "per_second": 50 },
                "10.0.0.124": { "until": yesterday, "per_second": 50 },
                "10.0.0.1": { "size": 1, "per_hour": 2 },
                "0.0.0.0": { "size": 100, "unlimited": true },
                "8.8.8.8": { "size": 10 },
                "9.8.7.6": { "size": 200 },
                "123.123.123.123": { "per_second": 1000, "fixed_window": true },
                "124.124.124.124": { "per_second": 1000, "fixed_window": false }
            }
        },
        "user": {
            "size": 1,
            "per_second": 5,
            "overrides": {
                "regexp": { "match": "^regexp", "size": 10 }
            }
        },
        "tenant": { "size": 1, "per_second": 1 },
        "global": {
            "size": 3,
            "per_hour": 2,
            "overrides": {
                "skipit": { "skip_n_calls": 2, "size": 3, "per_hour": 3 },
                "skipOneSize10": { "skip_n_calls": 1, "size": 10, "per_hour": 0 },
                "skipOneSize3": { "skip_n_calls": 1, "size": 3, "per_hour": 0 }
            }
        }
    })
}

pub fn parse_buckets(value: Value) -> TestResult<BTreeMap<String, BucketSpec>> {
    Ok(serde_json::from_value(value)?)
}

pub fn spec(value: Value) -> TestResult<BucketSpec> {
    Ok(serde_json::from_value(value)?)
}

/// Engine over an in-memory store, both driven by a manual clock
pub struct Harness {
    pub db: BucketDb,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn advance(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }
}

pub fn harness(buckets: Value) -> TestResult<Harness> {
    build_harness(buckets, MemoryStore::new)
}

pub fn cluster_harness(buckets: Value, nodes: usize) -> TestResult<Harness> {
    build_harness(buckets, |clock| MemoryStore::cluster(nodes, clock))
}

fn build_harness<F>(buckets: Value, make_store: F) -> TestResult<Harness>
where
    F: FnOnce(Arc<dyn bucketdb_lib::Clock>) -> MemoryStore,
{
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = Arc::new(make_store(clock.clone()));
    let db = BucketDb::builder(store.clone())
        .buckets(parse_buckets(buckets)?)
        .prefix(PREFIX)
        .clock(clock.clone())
        .build()?;
    Ok(Harness { db, store, clock })
}
