mod helpers;

use std::sync::Arc;

use bucketdb_lib::config::LoggingConfig;
use bucketdb_lib::telemetry::{init_metrics, init_tracing};
use bucketdb_lib::{BucketDb, BucketRequest, ManualClock, MemoryStore};
use helpers::{default_buckets, parse_buckets, TestResult, START_MS};
use prometheus::TextEncoder;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_engine_records_metrics() -> TestResult {
    let (metrics, registry) = init_metrics()?;
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let db = BucketDb::builder(store)
        .buckets(parse_buckets(default_buckets())?)
        .clock(clock)
        .metrics(metrics)
        .build()?;

    let req = BucketRequest::new("tenant", "t1");
    db.take(&req).await?;
    db.take(&req).await?;
    let skipped = BucketRequest::new("global", "skipOneSize3");
    db.take(&skipped).await?;
    db.take(&skipped).await?;

    let exposition = TextEncoder::new().encode_to_string(&registry.gather())?;
    for expected in [
        "bucketdb_take_requests",
        "bucketdb_take_conformant",
        "bucketdb_take_rejected",
        "bucketdb_skip_cache_hits",
        "bucketdb_store_duration_seconds",
    ] {
        assert!(exposition.contains(expected), "{expected} missing from:\n{exposition}");
    }
    Ok(())
}

#[test]
#[serial]
fn test_tracing_installs_once() -> TestResult {
    let logging = LoggingConfig { level: "debug".to_string(), show_target: true };
    init_tracing(&logging)?;
    assert!(init_tracing(&logging).is_err(), "a second global subscriber must be refused");
    Ok(())
}
