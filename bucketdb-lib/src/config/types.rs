use serde::Deserialize;
use std::collections::BTreeMap;

use super::telemetry::LoggingConfig;

/// Numeric capacity and refill fields shared by buckets, overrides and
/// elevated limits
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct LimitSpec {
    /// Bucket capacity
    /// Default: `per_interval` when a refill rate is given, otherwise 0
    #[serde(default)]
    pub size: Option<i64>,
    /// Refill window in milliseconds, used together with `per_interval`
    /// Default: 1000 when only `per_interval` is set
    #[serde(default)]
    pub interval: Option<u64>,
    /// Tokens added per `interval`
    /// A value of 0 means the bucket never refills
    #[serde(default)]
    pub per_interval: Option<u64>,
    /// Shorthand: `per_interval` tokens every second
    #[serde(default)]
    pub per_second: Option<u64>,
    /// Shorthand: `per_interval` tokens every minute
    #[serde(default)]
    pub per_minute: Option<u64>,
    /// Shorthand: `per_interval` tokens every hour
    #[serde(default)]
    pub per_hour: Option<u64>,
    /// Shorthand: `per_interval` tokens every day
    #[serde(default)]
    pub per_day: Option<u64>,
}

impl LimitSpec {
    /// Shorthand fields that are set, in precedence order
    pub fn shorthands(&self) -> Vec<(&'static str, u64)> {
        [
            ("per_second", self.per_second),
            ("per_minute", self.per_minute),
            ("per_hour", self.per_hour),
            ("per_day", self.per_day),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }

    /// True when no capacity or rate field is present
    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.interval.is_none()
            && self.per_interval.is_none()
            && self.shorthands().is_empty()
    }
}

/// Exponential backoff parameters for `take_exponential`
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct BackoffSpec {
    /// Multiplier applied per consecutive rejection
    pub backoff_factor: f64,
    /// Base wait in milliseconds
    pub multiple_unit: f64,
}

/// Elevated rate limit definition
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ElevatedLimitsSpec {
    #[serde(flatten)]
    pub limits: LimitSpec,
    /// How long an activation lasts, in seconds
    /// Optional here; may also be supplied per call
    #[serde(default)]
    pub erl_activation_period_seconds: Option<u64>,
    /// Number of activations allowed per UTC calendar month
    /// Optional here; may also be supplied per call
    #[serde(default)]
    pub quota_per_calendar_month: Option<i64>,
}

/// Fields common to a bucket type, an override, and a per-call override
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct TypeSpec {
    #[serde(flatten)]
    pub limits: LimitSpec,
    /// Skip the store entirely and always admit
    /// Default: false
    #[serde(default)]
    pub unlimited: bool,
    /// Answer this many calls per key from the local cache between store round trips
    /// Default: 0 (every call reaches the store)
    #[serde(default)]
    pub skip_n_calls: u32,
    /// Refill the whole bucket at window boundaries instead of dripping
    /// Default: false
    #[serde(default)]
    pub fixed_window: bool,
    #[serde(default)]
    pub exponential_backoff: Option<BackoffSpec>,
    #[serde(default)]
    pub elevated_limits: Option<ElevatedLimitsSpec>,
}

/// Expiry instant of an override: RFC 3339 text or epoch milliseconds
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Until {
    Millis(i64),
    Text(String),
}

/// Per-key override of a bucket type
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct OverrideSpec {
    #[serde(flatten)]
    pub spec: TypeSpec,
    /// Overrides whose `until` is already in the past are dropped when the
    /// bucket is built
    #[serde(default)]
    pub until: Option<Until>,
    /// Case-insensitive regular expression; when set the override applies to
    /// every matching key instead of the key named by the override
    #[serde(default, rename = "match")]
    pub pattern: Option<String>,
}

/// Bucket type definition
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct BucketSpec {
    #[serde(flatten)]
    pub spec: TypeSpec,
    /// Overrides keyed by exact key (or by an arbitrary name for `match` overrides)
    /// Regex overrides are evaluated in name order
    #[serde(default)]
    pub overrides: BTreeMap<String, OverrideSpec>,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Prepended to every key written to the store
    /// Default: ""
    #[serde(default)]
    pub prefix: String,
    /// Store-side expiry for buckets without a refill rate, in seconds
    /// Default: 604800 (7 days)
    #[serde(default = "default_global_ttl_secs")]
    pub global_ttl_secs: u64,
    /// Bucket types by name
    /// At least one bucket is required
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketSpec>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn new(buckets: BTreeMap<String, BucketSpec>) -> Self {
        Self {
            prefix: String::new(),
            global_ttl_secs: default_global_ttl_secs(),
            buckets,
            logging: LoggingConfig::default(),
        }
    }
}

pub const DEFAULT_GLOBAL_TTL_SECS: u64 = 7 * 24 * 60 * 60;

fn default_global_ttl_secs() -> u64 {
    DEFAULT_GLOBAL_TTL_SECS
}
