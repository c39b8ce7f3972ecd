mod helpers;

use bucketdb_lib::BucketRequest;
use helpers::{default_buckets, harness, TestResult, START_MS};

#[tokio::test]
async fn test_put_restores_tokens() -> TestResult {
    let h = harness(default_buckets())?;
    h.db.take(&BucketRequest::new("ip", "10.1.0.1").all()).await?;

    let snapshot = h.db.put(&BucketRequest::new("ip", "10.1.0.1").count(4)).await?;
    assert_eq!(snapshot.remaining, 4);
    assert_eq!(snapshot.limit, 10);

    let result = h.db.take(&BucketRequest::new("ip", "10.1.0.1")).await?;
    assert!(result.conformant);
    assert_eq!(result.remaining, 3);
    Ok(())
}

#[tokio::test]
async fn test_put_defaults_to_full_bucket() -> TestResult {
    let h = harness(default_buckets())?;
    h.db.take(&BucketRequest::new("ip", "10.1.0.2").count(7)).await?;

    let snapshot = h.db.put(&BucketRequest::new("ip", "10.1.0.2")).await?;
    assert_eq!(snapshot.remaining, 10);
    assert_eq!(snapshot.reset, START_MS / 1000);

    h.db.take(&BucketRequest::new("ip", "10.1.0.2").count(7)).await?;
    let snapshot = h.db.put(&BucketRequest::new("ip", "10.1.0.2").all()).await?;
    assert_eq!(snapshot.remaining, 10);
    Ok(())
}

#[tokio::test]
async fn test_put_is_capped_at_size() -> TestResult {
    let h = harness(default_buckets())?;
    h.db.take(&BucketRequest::new("ip", "10.1.0.3")).await?;
    let snapshot = h.db.put(&BucketRequest::new("ip", "10.1.0.3").count(1_000)).await?;
    assert_eq!(snapshot.remaining, 10);
    Ok(())
}

#[tokio::test]
async fn test_negative_put_drains_below_zero() -> TestResult {
    let h = harness(default_buckets())?;
    let snapshot = h.db.put(&BucketRequest::new("ip", "10.1.0.4").count(-100)).await?;
    assert_eq!(snapshot.remaining, -90);

    let result = h.db.take(&BucketRequest::new("ip", "10.1.0.4")).await?;
    assert!(!result.conformant);
    assert_eq!(result.remaining, -90);
    Ok(())
}

#[tokio::test]
async fn test_reset_refills_completely() -> TestResult {
    let h = harness(default_buckets())?;
    h.db.take(&BucketRequest::new("ip", "10.1.0.5").all()).await?;

    // the count of the request is ignored
    let snapshot = h.db.reset(&BucketRequest::new("ip", "10.1.0.5").count(1)).await?;
    assert_eq!(snapshot.remaining, 10);
    Ok(())
}

#[tokio::test]
async fn test_get_reports_full_bucket_for_unknown_key() -> TestResult {
    let h = harness(default_buckets())?;
    let snapshot = h.db.get(&BucketRequest::new("ip", "10.1.0.6")).await?;
    assert_eq!(snapshot.remaining, 10);
    assert_eq!(snapshot.limit, 10);
    assert_eq!(snapshot.reset, START_MS / 1000);
    assert!(h.store.is_empty()?, "get must not create the bucket");
    Ok(())
}

#[tokio::test]
async fn test_get_does_not_consume() -> TestResult {
    let h = harness(default_buckets())?;
    h.db.take(&BucketRequest::new("ip", "10.1.0.7")).await?;

    for _ in 0..3 {
        let snapshot = h.db.get(&BucketRequest::new("ip", "10.1.0.7")).await?;
        assert_eq!(snapshot.remaining, 9);
        assert_eq!(snapshot.reset, (START_MS + 200).div_ceil(1000));
    }
    Ok(())
}

#[tokio::test]
async fn test_get_static_bucket_has_no_reset() -> TestResult {
    let h = harness(default_buckets())?;
    h.db.take(&BucketRequest::new("ip", "8.8.8.8").count(3)).await?;
    let snapshot = h.db.get(&BucketRequest::new("ip", "8.8.8.8")).await?;
    assert_eq!(snapshot.remaining, 7);
    assert_eq!(snapshot.reset, 0);
    Ok(())
}

#[tokio::test]
async fn test_unlimited_put_and_get() -> TestResult {
    let h = harness(default_buckets())?;
    let snapshot = h.db.put(&BucketRequest::new("ip", "0.0.0.0").count(5)).await?;
    assert_eq!(snapshot.remaining, 100);
    let snapshot = h.db.get(&BucketRequest::new("ip", "0.0.0.0")).await?;
    assert_eq!(snapshot.remaining, 100);
    assert!(h.store.is_empty()?);
    Ok(())
}
