#![forbid(unsafe_code)]

pub mod bucket;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod store;
pub mod telemetry;

pub use config::{load_from_path, BucketSpec, EngineConfig};
pub use engine::{
    BucketDb, BucketRequest, BucketSnapshot, Count, ErlParams, TakeElevatedResult,
    TakeExponentialResult, TakeResult, WaitOptions,
};
pub use error::{ConfigError, LimitError, Result, StoreError, ValidationError};
pub use store::{Clock, ManualClock, MemoryStore, Store, SystemClock};
