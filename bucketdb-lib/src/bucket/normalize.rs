use ahash::AHashMap;
use chrono::DateTime;
use lru::LruCache;
use regex::{Regex, RegexBuilder};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::config::{BackoffSpec, BucketSpec, ElevatedLimitsSpec, LimitSpec, TypeSpec, Until};
use crate::error::ConfigError;

pub const SECOND_MS: u64 = 1000;
pub const MINUTE_MS: u64 = 60 * SECOND_MS;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Capacity of the per-type regex match cache
pub const OVERRIDE_CACHE_SIZE: usize = 50;

/// Drip refill rate: `per_interval` tokens every `interval_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refill {
    pub interval_ms: u64,
    pub per_interval: u64,
}

impl Refill {
    pub fn tokens_per_ms(&self) -> f64 {
        self.per_interval as f64 / self.interval_ms as f64
    }

    /// Milliseconds between two single-token drips
    pub fn drip_interval_ms(&self) -> f64 {
        self.interval_ms as f64 / self.per_interval as f64
    }
}

/// Normalized capacity and rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    pub size: i64,
    pub refill: Option<Refill>,
    /// Seconds for the bucket to refill from empty; `None` without a refill rate
    pub ttl_secs: Option<u64>,
}

impl BucketLimits {
    pub fn interval_ms(&self) -> Option<u64> {
        self.refill.map(|r| r.interval_ms)
    }

    pub fn per_interval(&self) -> Option<u64> {
        self.refill.map(|r| r.per_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub factor: f64,
    pub multiple_unit: f64,
}

impl From<BackoffSpec> for Backoff {
    fn from(spec: BackoffSpec) -> Self {
        Self { factor: spec.backoff_factor, multiple_unit: spec.multiple_unit }
    }
}

/// Normalized elevated limits of a bucket type
#[derive(Debug, Clone, PartialEq)]
pub struct ElevatedLimits {
    pub limits: BucketLimits,
    pub activation_period_secs: Option<u64>,
    pub quota_per_calendar_month: Option<i64>,
    /// Both size and a refill rate resolved
    pub configured: bool,
}

/// Runtime parameters of a bucket type or of one of its overrides
#[derive(Debug, Clone, PartialEq)]
pub struct BucketParams {
    pub limits: BucketLimits,
    pub unlimited: bool,
    pub skip_n_calls: u32,
    pub fixed_window: bool,
    pub backoff: Option<Backoff>,
    pub elevated: Option<ElevatedLimits>,
}

impl BucketParams {
    pub fn size(&self) -> i64 {
        self.limits.size
    }

    pub fn refill(&self) -> Option<Refill> {
        self.limits.refill
    }

    pub fn is_erl_configured(&self) -> bool {
        self.elevated.as_ref().is_some_and(|e| e.configured)
    }
}

/// A bucket type with its compiled overrides
#[derive(Debug)]
pub struct BucketType {
    pub name: String,
    pub base: Arc<BucketParams>,
    /// Exact-key overrides
    pub overrides: AHashMap<String, Arc<BucketParams>>,
    /// Regex overrides in evaluation order
    pub overrides_match: Vec<(Regex, Arc<BucketParams>)>,
    /// Resolved regex matches by key; allocated only when `overrides_match` is non-empty
    pub overrides_cache: Option<Mutex<LruCache<String, Arc<BucketParams>>>>,
}

/// Resolves `(interval, per_interval)` from explicit fields or a shorthand.
fn resolve_rate(limits: &LimitSpec) -> Option<(u64, u64)> {
    let shorthand = [
        (limits.per_second, SECOND_MS),
        (limits.per_minute, MINUTE_MS),
        (limits.per_hour, HOUR_MS),
        (limits.per_day, DAY_MS),
    ]
    .into_iter()
    .find_map(|(value, interval)| value.map(|v| (interval, v)));

    shorthand.or_else(|| limits.per_interval.map(|p| (limits.interval.unwrap_or(SECOND_MS), p)))
}

pub fn normalize_limits(limits: &LimitSpec) -> BucketLimits {
    let rate = resolve_rate(limits);
    let size = limits.size.unwrap_or_else(|| rate.map_or(0, |(_, p)| p as i64));

    // a zero rate or window means no refill at all
    let refill = rate
        .filter(|&(interval, per_interval)| interval > 0 && per_interval > 0)
        .map(|(interval_ms, per_interval)| Refill { interval_ms, per_interval });

    let ttl_secs = refill.map(|r| {
        let secs = size.max(0) as f64 * r.interval_ms as f64 / r.per_interval as f64 / 1000.0;
        secs.ceil() as u64
    });

    BucketLimits { size, refill, ttl_secs }
}

fn normalize_elevated(spec: &ElevatedLimitsSpec) -> ElevatedLimits {
    let limits = normalize_limits(&spec.limits);
    ElevatedLimits {
        limits,
        activation_period_secs: spec.erl_activation_period_seconds,
        quota_per_calendar_month: spec.quota_per_calendar_month,
        // size falls back to per_interval, so a refill rate resolves both
        configured: limits.refill.is_some(),
    }
}

/// Normalizes one type, override, or per-call override into runtime parameters
pub fn normalize_temporals(spec: &TypeSpec) -> BucketParams {
    BucketParams {
        limits: normalize_limits(&spec.limits),
        unlimited: spec.unlimited,
        skip_n_calls: spec.skip_n_calls,
        fixed_window: spec.fixed_window,
        backoff: spec.exponential_backoff.map(Backoff::from),
        elevated: spec.elevated_limits.as_ref().map(normalize_elevated),
    }
}

/// Normalizes an override, inheriting what it leaves out from its parent.
///
/// Without any capacity or rate of its own the override keeps the parent's
/// numbers; without `elevated_limits` it keeps the parent's elevated limits.
fn normalize_override(spec: &TypeSpec, parent: &BucketParams) -> BucketParams {
    let mut params = normalize_temporals(spec);
    if spec.limits.is_empty() && !spec.unlimited {
        params.limits = parent.limits;
        params.unlimited = parent.unlimited;
    }
    if params.elevated.is_none() {
        params.elevated = parent.elevated.clone();
    }
    params
}

pub fn parse_until(label: &str, until: &Until) -> Result<i64, ConfigError> {
    let invalid = |value: String| ConfigError::InvalidUntil { bucket: label.to_string(), value };
    match until {
        Until::Millis(ms) => Ok(*ms),
        Until::Text(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.timestamp_millis())
            .map_err(|_| invalid(text.clone())),
    }
}

/// Builds the runtime form of one bucket type.
///
/// Overrides that expired before `now_ms` are dropped.
pub fn build_bucket(name: &str, spec: &BucketSpec, now_ms: u64) -> Result<BucketType, ConfigError> {
    let base = normalize_temporals(&spec.spec);

    let mut overrides = AHashMap::new();
    let mut overrides_match = Vec::new();

    for (override_name, ov) in &spec.overrides {
        let label = format!("{name}.overrides.{override_name}");
        if let Some(until) = &ov.until {
            let until_ms = parse_until(&label, until)?;
            if until_ms < now_ms as i64 {
                warn!(bucket = %name, override_name = %override_name, "Dropping expired override");
                continue;
            }
        }

        let params = Arc::new(normalize_override(&ov.spec, &base));
        match &ov.pattern {
            Some(pattern) => {
                let regex =
                    RegexBuilder::new(pattern).case_insensitive(true).build().map_err(|e| {
                        ConfigError::InvalidRegex {
                            bucket: label.clone(),
                            pattern: pattern.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                overrides_match.push((regex, params));
            }
            None => {
                overrides.insert(override_name.clone(), params);
            }
        }
    }

    let overrides_cache = NonZeroUsize::new(OVERRIDE_CACHE_SIZE)
        .filter(|_| !overrides_match.is_empty())
        .map(|cap| Mutex::new(LruCache::new(cap)));

    Ok(BucketType {
        name: name.to_string(),
        base: Arc::new(base),
        overrides,
        overrides_match,
        overrides_cache,
    })
}

/// Builds every bucket type of a configuration
pub fn build_buckets<'a, I>(
    specs: I,
    now_ms: u64,
) -> Result<AHashMap<String, Arc<BucketType>>, ConfigError>
where
    I: IntoIterator<Item = (&'a String, &'a BucketSpec)>,
{
    specs
        .into_iter()
        .map(|(name, spec)| Ok((name.clone(), Arc::new(build_bucket(name, spec, now_ms)?))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(json: serde_json::Value) -> LimitSpec {
        serde_json::from_value(json).unwrap_or_default()
    }

    #[test]
    fn per_second_shorthand() {
        let l = normalize_limits(&limits(serde_json::json!({ "per_second": 10 })));
        assert_eq!(l.size, 10);
        assert_eq!(l.refill, Some(Refill { interval_ms: 1000, per_interval: 10 }));
        assert_eq!(l.ttl_secs, Some(1));
        assert_eq!(l.refill.map(|r| r.drip_interval_ms()), Some(100.0));
    }

    #[test]
    fn zero_rate_means_static_bucket() {
        let l = normalize_limits(&limits(serde_json::json!({ "size": 10, "per_second": 0 })));
        assert_eq!(l.size, 10);
        assert!(l.refill.is_none());
        assert!(l.ttl_secs.is_none());
    }

    #[test]
    fn ttl_rounds_up() {
        let l = normalize_limits(&limits(serde_json::json!({ "size": 3, "per_minute": 2 })));
        // 3 tokens at 2/min take 90s to refill
        assert_eq!(l.ttl_secs, Some(90));
        let l = normalize_limits(&limits(serde_json::json!({ "size": 1, "per_second": 3 })));
        assert_eq!(l.ttl_secs, Some(1));
    }
}
