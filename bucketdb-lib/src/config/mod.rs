mod loader;
mod telemetry;
mod types;

pub use loader::{load_from_path, validate_bucket, validate_config};
pub use telemetry::LoggingConfig;
pub use types::{
    BackoffSpec, BucketSpec, ElevatedLimitsSpec, EngineConfig, LimitSpec, OverrideSpec, TypeSpec,
    Until, DEFAULT_GLOBAL_TTL_SECS,
};
