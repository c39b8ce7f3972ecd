//! Bucket type normalization and per-key override resolution.

mod normalize;
mod resolver;

pub use normalize::{
    build_bucket, build_buckets, normalize_limits, normalize_temporals, parse_until, Backoff,
    BucketLimits, BucketParams, BucketType, ElevatedLimits, Refill, DAY_MS, HOUR_MS, MINUTE_MS,
    OVERRIDE_CACHE_SIZE, SECOND_MS,
};
pub use resolver::resolve;
