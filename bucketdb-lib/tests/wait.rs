mod helpers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bucketdb_lib::{BucketDb, BucketRequest, LimitError, MemoryStore, ValidationError, WaitOptions};
use helpers::{harness, parse_buckets, TestResult};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn wait_buckets() -> Value {
    json!({
        "fast": { "size": 10, "per_second": 100 },
        "slow": { "size": 1, "per_hour": 1 },
        "static": { "size": 2 }
    })
}

/// Engine on the wall clock, so waits actually refill the bucket
fn realtime_db() -> TestResult<BucketDb> {
    let store = Arc::new(MemoryStore::default());
    Ok(BucketDb::builder(store).buckets(parse_buckets(wait_buckets())?).build()?)
}

#[tokio::test]
async fn test_wait_returns_immediately_when_tokens_available() -> TestResult {
    let db = realtime_db()?;
    let result = db.wait(&BucketRequest::new("fast", "a").count(3), &WaitOptions::default()).await?;
    assert!(result.conformant);
    assert!(!result.delayed);
    assert_eq!(result.remaining, 7);
    Ok(())
}

#[tokio::test]
async fn test_wait_sleeps_until_refilled() -> TestResult {
    let db = realtime_db()?;
    db.take(&BucketRequest::new("fast", "b").all()).await?;

    let started = Instant::now();
    let result = db.wait(&BucketRequest::new("fast", "b").count(3), &WaitOptions::default()).await?;
    assert!(result.conformant);
    assert!(result.delayed);
    // 3 tokens at 100/s
    assert!(started.elapsed() >= Duration::from_millis(20), "waited {:?}", started.elapsed());
    Ok(())
}

#[tokio::test]
async fn test_wait_rejects_count_above_size() -> TestResult {
    let db = realtime_db()?;
    let err = db
        .wait(&BucketRequest::new("fast", "c").count(11), &WaitOptions::default())
        .await
        .err()
        .ok_or("expected an error")?;
    assert_eq!(
        err,
        LimitError::Validation(ValidationError::CountExceedsCapacity { count: 11, size: 10 })
    );
    Ok(())
}

#[tokio::test]
async fn test_wait_on_static_bucket_does_not_block() -> TestResult {
    let h = harness(wait_buckets())?;
    let req = BucketRequest::new("static", "d");
    h.db.take(&req.clone().all()).await?;

    let result = h.db.wait(&req, &WaitOptions::default()).await?;
    assert!(!result.conformant);
    assert!(!result.delayed);
    Ok(())
}

#[tokio::test]
async fn test_wait_gives_up_after_max_attempts() -> TestResult {
    // the manual clock never moves, so the bucket never refills
    let h = harness(wait_buckets())?;
    let req = BucketRequest::new("fast", "e");
    h.db.take(&req.clone().all()).await?;

    let result = h.db.wait(&req, &WaitOptions::default().max_attempts(2)).await?;
    assert!(!result.conformant);
    assert!(result.delayed);
    Ok(())
}

#[tokio::test]
async fn test_wait_can_be_cancelled() -> TestResult {
    let h = harness(wait_buckets())?;
    let req = BucketRequest::new("slow", "f");
    h.db.take(&req).await?;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        h.db.wait(&req, &WaitOptions::default().cancel(token)),
    )
    .await?;
    assert_eq!(result, Err(LimitError::Cancelled));
    Ok(())
}
