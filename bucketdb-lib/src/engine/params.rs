use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::config::TypeSpec;
use crate::error::{Result, ValidationError};

/// Requested token count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Exact(i64),
    /// The bucket's full size
    All,
}

impl Count {
    /// Resolves against the bucket size
    pub fn tokens(self, size: i64) -> i64 {
        match self {
            Count::Exact(n) => n,
            Count::All => size,
        }
    }
}

impl From<i64> for Count {
    fn from(n: i64) -> Self {
        Count::Exact(n)
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Count::Exact(n) => write!(f, "{n}"),
            Count::All => f.write_str("all"),
        }
    }
}

impl TryFrom<&Value> for Count {
    type Error = ValidationError;

    /// Accepts an integer or the exact string `"all"`.
    fn try_from(value: &Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::String(s) if s == "all" => Ok(Count::All),
            Value::Number(n) => n
                .as_i64()
                .map(Count::Exact)
                .ok_or_else(|| ValidationError::InvalidCount { raw: value.to_string() }),
            other => Err(ValidationError::InvalidCount { raw: other.to_string() }),
        }
    }
}

impl<'de> Deserialize<'de> for Count {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Count::try_from(&value).map_err(serde::de::Error::custom)
    }
}

/// Per-call elevated limit parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErlParams {
    /// Name of the active flag key; hashed into the bucket key's slot
    #[serde(default)]
    pub erl_is_active_key: Option<String>,
    /// Name of the monthly quota counter key; hashed into the bucket key's slot
    #[serde(default)]
    pub erl_quota_key: Option<String>,
    #[serde(default)]
    pub erl_activation_period_seconds: Option<u64>,
    #[serde(default)]
    pub quota_per_calendar_month: Option<i64>,
}

impl ErlParams {
    pub fn new(
        erl_is_active_key: impl Into<String>,
        erl_quota_key: impl Into<String>,
        erl_activation_period_seconds: u64,
        quota_per_calendar_month: i64,
    ) -> Self {
        Self {
            erl_is_active_key: Some(erl_is_active_key.into()),
            erl_quota_key: Some(erl_quota_key.into()),
            erl_activation_period_seconds: Some(erl_activation_period_seconds),
            quota_per_calendar_month: Some(quota_per_calendar_month),
        }
    }
}

/// Parameters of a bucket operation.
///
/// `count` defaults to 1 for takes and to the bucket size for `put`.
/// `elevated_limits` is only read by `take_elevated`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BucketRequest {
    #[serde(rename = "type", default)]
    pub bucket_type: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub count: Option<Count>,
    #[serde(default, rename = "configOverride", alias = "config_override")]
    pub config_override: Option<TypeSpec>,
    /// Per-call fixed-window switch; only effective on fixed-window buckets
    #[serde(default)]
    pub fixed_window: Option<bool>,
    #[serde(default)]
    pub elevated_limits: Option<ErlParams>,
}

impl BucketRequest {
    pub fn new(bucket_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self { bucket_type: bucket_type.into(), key: key.into(), ..Self::default() }
    }

    pub fn count(mut self, count: i64) -> Self {
        self.count = Some(Count::Exact(count));
        self
    }

    pub fn all(mut self) -> Self {
        self.count = Some(Count::All);
        self
    }

    pub fn config_override(mut self, spec: TypeSpec) -> Self {
        self.config_override = Some(spec);
        self
    }

    pub fn fixed_window(mut self, enabled: bool) -> Self {
        self.fixed_window = Some(enabled);
        self
    }

    pub fn elevated_limits(mut self, params: ErlParams) -> Self {
        self.elevated_limits = Some(params);
        self
    }

    /// Parses a loosely typed request, reporting caller mistakes as
    /// validation errors.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(ValidationError::MissingParams.into());
        };
        if let Some(count) = fields.get("count").filter(|c| !c.is_null()) {
            Count::try_from(count)?;
        }
        let config_override =
            fields.get("configOverride").or_else(|| fields.get("config_override"));
        if let Some(ov) = config_override.filter(|o| !o.is_null()) {
            if !ov.is_object() {
                return Err(ValidationError::ConfigOverrideNotObject.into());
            }
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::MalformedParams(e.to_string()).into())
    }
}

/// Response of `take` and `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TakeResult {
    pub conformant: bool,
    pub remaining: i64,
    /// Unix seconds at which the bucket is full again
    pub reset: u64,
    pub limit: i64,
    pub delta_reset_ms: u64,
    /// Set by `wait` when the call had to be retried
    pub delayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ElevatedLimitsResult {
    pub erl_configured_for_bucket: bool,
    /// This call activated elevated limits
    pub triggered: bool,
    /// Elevated limits are in effect
    pub activated: bool,
    pub quota_remaining: i64,
    pub quota_allocated: i64,
    pub erl_activation_period_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TakeElevatedResult {
    #[serde(flatten)]
    pub take: TakeResult,
    pub elevated_limits: ElevatedLimitsResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TakeExponentialResult {
    #[serde(flatten)]
    pub take: TakeResult,
    pub backoff_factor: f64,
    /// Suggested wait before the next attempt, in milliseconds
    pub backoff_time: u64,
    pub attempt: u32,
}

/// Response of `put`, `reset` and `get`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    pub remaining: i64,
    pub reset: u64,
    pub limit: i64,
}
