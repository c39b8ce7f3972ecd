//! Storage seam.
//!
//! The engine never reads and writes bucket keys itself. It hands a [`Store`]
//! the limits for one call and the store runs the matching
//! [`script`](crate::engine::script) function atomically over the keys the
//! call touches, using its own clock for "now".

mod clock;
mod memory;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::bucket::Backoff;
use crate::engine::script::{
    BucketState, ElevatedOutcome, ErlLimits, ExponentialOutcome, Outcome, ScriptLimits,
};
use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store keys touched by a take-elevated call; all three share one hash slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevatedKeys {
    pub bucket: String,
    pub erl_is_active: String,
    pub erl_quota: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn take(&self, key: &str, limits: &ScriptLimits, count: i64) -> StoreResult<Outcome>;

    async fn take_exponential(
        &self,
        key: &str,
        limits: &ScriptLimits,
        count: i64,
        backoff: Backoff,
    ) -> StoreResult<ExponentialOutcome>;

    async fn take_elevated(
        &self,
        keys: &ElevatedKeys,
        base: &ScriptLimits,
        erl: Option<&ErlLimits>,
        count: i64,
    ) -> StoreResult<ElevatedOutcome>;

    async fn put(&self, key: &str, limits: &ScriptLimits, count: i64) -> StoreResult<Outcome>;

    /// Reads a bucket without refilling or writing it
    async fn get(&self, key: &str) -> StoreResult<Option<BucketState>>;

    /// Deletes keys in one command, returning how many existed
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Drops every key on every node
    async fn flush_all(&self) -> StoreResult<()>;
}
