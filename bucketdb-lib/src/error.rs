use thiserror::Error;

/// Caller mistakes detected before the store is touched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("params are required")]
    MissingParams,

    #[error("type is required")]
    MissingType,

    #[error("undefined bucket type {name}")]
    UndefinedBucketType { name: String },

    #[error("key is required")]
    EmptyKey,

    #[error("configuration overrides must be an object")]
    ConfigOverrideNotObject,

    #[error("configuration overrides must provide either a size or interval")]
    InvalidConfigOverride,

    #[error("if provided, count must be 'all' or an integer value")]
    InvalidCount { raw: String },

    #[error("count {count} is negative; only put accepts negative counts")]
    NegativeCount { count: i64 },

    #[error("{}", missing_erl_field_message(.field))]
    MissingErlField { field: &'static str },

    #[error("count {count} exceeds bucket size {size} and can never be satisfied")]
    CountExceedsCapacity { count: i64, size: i64 },

    #[error("bucket type {bucket_type} has no exponential_backoff configured")]
    BackoffNotConfigured { bucket_type: String },

    #[error("malformed params: {0}")]
    MalformedParams(String),
}

fn missing_erl_field_message(field: &str) -> String {
    match field {
        "erl_activation_period_seconds" => {
            "erl_activation_period_seconds is required for elevated limits".to_string()
        }
        "quota_per_calendar_month" => {
            "a valid quota amount per interval is required for elevated limits".to_string()
        }
        other => format!("{other} is required for elevated limits"),
    }
}

/// Malformed bucket definitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Load(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("No buckets configured")]
    NoBuckets,

    #[error("bucket {bucket}: invalid match expression {pattern}: {reason}")]
    InvalidRegex { bucket: String, pattern: String, reason: String },

    #[error("bucket {bucket}: invalid until {value}")]
    InvalidUntil { bucket: String, value: String },

    #[error("bucket {bucket}: {reason}")]
    InvalidInterval { bucket: String, reason: String },
}

/// Failures raised by the backing store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot { keys: Vec<String> },

    #[error("Failed deleting key(s) {}: {reason}", .keys.join(","))]
    DeleteFailed { keys: Vec<String>, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out")]
    Timeout,
}

/// Errors returned by every engine operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("wait cancelled")]
    Cancelled,
}

impl LimitError {
    /// Only store failures may be retried or counted against a circuit breaker.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LimitError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, LimitError>;
