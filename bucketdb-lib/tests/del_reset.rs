mod helpers;

use bucketdb_lib::{BucketRequest, LimitError, StoreError};
use helpers::{cluster_harness, default_buckets, harness, TestResult};

#[tokio::test]
async fn test_del_missing_key_returns_zero() -> TestResult {
    let h = harness(default_buckets())?;
    assert_eq!(h.db.del(&["ip:nothing-here"]).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_del_drops_bucket_state() -> TestResult {
    let h = harness(default_buckets())?;
    let req = BucketRequest::new("ip", "10.2.0.1");
    h.db.take(&req.clone().all()).await?;
    h.db.take(&BucketRequest::new("ip", "10.2.0.2")).await?;

    assert_eq!(h.db.del(&["ip:10.2.0.1", "ip:10.2.0.2", "ip:10.2.0.3"]).await?, 2);
    assert!(h.store.is_empty()?);

    let result = h.db.take(&req).await?;
    assert!(result.conformant);
    assert_eq!(result.remaining, 9);
    Ok(())
}

#[tokio::test]
async fn test_del_across_slots_fails_in_cluster() -> TestResult {
    let h = cluster_harness(default_buckets(), 3)?;
    let err = h.db.del(&["ip:10.0.0.1", "ip:10.0.0.2"]).await.err().ok_or("expected an error")?;

    let LimitError::Store(StoreError::DeleteFailed { keys, reason }) = &err else {
        return Err(format!("unexpected error {err:?}").into());
    };
    assert_eq!(keys, &vec!["ip:10.0.0.1".to_string(), "ip:10.0.0.2".to_string()]);
    assert!(reason.starts_with("CROSSSLOT Keys in request don't hash to the same slot"));
    assert!(reason.contains("running the command separately for each key"));
    assert!(err
        .to_string()
        .starts_with("Failed deleting key(s) ip:10.0.0.1,ip:10.0.0.2: CROSSSLOT"));
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_del_with_shared_hashtag_in_cluster() -> TestResult {
    let h = cluster_harness(default_buckets(), 3)?;
    h.db.take(&BucketRequest::new("ip", "{u}:a")).await?;
    h.db.take(&BucketRequest::new("ip", "{u}:b")).await?;
    assert_eq!(h.db.del(&["ip:{u}:a", "ip:{u}:b"]).await?, 2);

    // one key per command always works
    h.db.take(&BucketRequest::new("ip", "10.0.0.2")).await?;
    assert_eq!(h.db.del(&["ip:10.0.0.2"]).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_reset_all_empties_store() -> TestResult {
    let h = harness(default_buckets())?;
    for key in ["10.2.0.4", "10.2.0.5", "10.2.0.6"] {
        h.db.take(&BucketRequest::new("ip", key).all()).await?;
    }
    assert_eq!(h.store.len()?, 3);

    h.db.reset_all().await?;
    assert!(h.store.is_empty()?);
    let result = h.db.take(&BucketRequest::new("ip", "10.2.0.4")).await?;
    assert_eq!(result.remaining, 9);
    Ok(())
}

#[tokio::test]
async fn test_reset_all_clears_every_node() -> TestResult {
    let h = cluster_harness(default_buckets(), 3)?;
    for key in ["10.0.0.2", "192.168.1.1", "{u}:c"] {
        h.db.take(&BucketRequest::new("ip", key)).await?;
    }
    h.db.reset_all().await?;
    assert!(h.store.is_empty()?);
    Ok(())
}
