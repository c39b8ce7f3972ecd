use ahash::AHashMap;
use std::sync::Arc;

use super::params::{BucketRequest, Count, ErlParams};
use crate::bucket::{BucketParams, BucketType};
use crate::config::TypeSpec;
use crate::error::{Result, ValidationError};

/// Checks the request shape and returns the bucket type it names.
pub fn validate_request(
    request: &BucketRequest,
    buckets: &AHashMap<String, Arc<BucketType>>,
) -> Result<Arc<BucketType>> {
    if request.bucket_type.is_empty() {
        return Err(ValidationError::MissingType.into());
    }
    let bucket = buckets.get(&request.bucket_type).ok_or_else(|| {
        ValidationError::UndefinedBucketType { name: request.bucket_type.clone() }
    })?;
    if request.key.is_empty() {
        return Err(ValidationError::EmptyKey.into());
    }
    if let Some(spec) = &request.config_override {
        validate_override(spec)?;
    }
    Ok(Arc::clone(bucket))
}

/// A per-call override needs a size or a refill shorthand.
pub fn validate_override(spec: &TypeSpec) -> Result<()> {
    if spec.limits.size.is_some() || !spec.limits.shorthands().is_empty() {
        Ok(())
    } else {
        Err(ValidationError::InvalidConfigOverride.into())
    }
}

pub fn resolve_count(count: Option<Count>, default: i64, size: i64) -> i64 {
    count.map_or(default, |c| c.tokens(size))
}

/// Count for the take family, which never adds tokens.
pub fn resolve_take_count(count: Option<Count>, size: i64) -> Result<i64> {
    match resolve_count(count, 1, size) {
        n if n < 0 => Err(ValidationError::NegativeCount { count: n }.into()),
        n => Ok(n),
    }
}

/// Fixed-window refill applies only when the bucket enables it and the call
/// does not opt out.
pub fn fixed_window_enabled(params: &BucketParams, requested: Option<bool>) -> bool {
    params.fixed_window && requested.unwrap_or(true)
}

/// Elevated parameters after merging the call with the bucket definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedErlParams {
    pub erl_is_active_key: String,
    pub erl_quota_key: String,
    pub activation_period_secs: u64,
    pub quota: i64,
}

pub const DEFAULT_ERL_ACTIVE_KEY: &str = "ERLActiveKey";
pub const DEFAULT_ERL_QUOTA_KEY: &str = "ERLQuotaKey";

impl Default for ResolvedErlParams {
    fn default() -> Self {
        Self {
            erl_is_active_key: DEFAULT_ERL_ACTIVE_KEY.to_string(),
            erl_quota_key: DEFAULT_ERL_QUOTA_KEY.to_string(),
            activation_period_secs: 0,
            quota: 0,
        }
    }
}

/// Validates call-supplied elevated parameters.
///
/// Key names must come from the call; the activation period and quota fall
/// back to the bucket's `elevated_limits`.
pub fn resolve_erl_params(params: &ErlParams, bucket: &BucketParams) -> Result<ResolvedErlParams> {
    let required_key = |value: &Option<String>, field: &'static str| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or(ValidationError::MissingErlField { field })
    };

    let erl_is_active_key = required_key(&params.erl_is_active_key, "erl_is_active_key")?;
    let erl_quota_key = required_key(&params.erl_quota_key, "erl_quota_key")?;

    let elevated = bucket.elevated.as_ref();
    let activation_period_secs = params
        .erl_activation_period_seconds
        .or_else(|| elevated.and_then(|e| e.activation_period_secs))
        .ok_or(ValidationError::MissingErlField { field: "erl_activation_period_seconds" })?;
    let quota = params
        .quota_per_calendar_month
        .or_else(|| elevated.and_then(|e| e.quota_per_calendar_month))
        .filter(|q| *q >= 0)
        .ok_or(ValidationError::MissingErlField { field: "quota_per_calendar_month" })?;

    Ok(ResolvedErlParams { erl_is_active_key, erl_quota_key, activation_period_secs, quota })
}
