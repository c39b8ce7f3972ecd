use ahash::AHashMap;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::{Clock, ElevatedKeys, Store, StoreResult, SystemClock};
use crate::bucket::Backoff;
use crate::engine::script::{
    self, BucketState, ElevatedOutcome, ErlLimits, ErlSnapshot, ExponentialOutcome, Outcome,
    ScriptLimits,
};
use crate::error::StoreError;
use crate::keys::{hash_slot, HASH_SLOTS};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Bucket(BucketState),
    Counter(i64),
    Flag,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

/// Keys owned by one node
#[derive(Debug, Default)]
struct Keyspace {
    entries: AHashMap<String, Entry>,
}

impl Keyspace {
    fn get(&mut self, key: &str, now_ms: u64) -> Option<Entry> {
        let entry = *self.entries.get(key)?;
        match entry.expires_at_ms {
            Some(at) if at <= now_ms => {
                self.entries.remove(key);
                None
            }
            _ => Some(entry),
        }
    }

    fn set(&mut self, key: &str, value: Value, ttl_ms: Option<u64>, now_ms: u64) {
        let expires_at_ms = ttl_ms.map(|ttl| now_ms + ttl);
        self.entries.insert(key.to_string(), Entry { value, expires_at_ms });
    }

    /// Updates the value and keeps the current expiry
    fn set_keep_ttl(&mut self, key: &str, value: Value, now_ms: u64) {
        let expires_at_ms = self.get(key, now_ms).and_then(|e| e.expires_at_ms);
        self.entries.insert(key.to_string(), Entry { value, expires_at_ms });
    }

    fn bucket(&mut self, key: &str, now_ms: u64) -> Option<BucketState> {
        match self.get(key, now_ms)?.value {
            Value::Bucket(state) => Some(state),
            _ => None,
        }
    }

    fn remove(&mut self, key: &str, now_ms: u64) -> bool {
        let existed = self.get(key, now_ms).is_some();
        self.entries.remove(key);
        existed
    }
}

/// In-process store.
///
/// Every script runs while holding the lock of the node that owns its keys,
/// which makes it atomic with respect to other calls on those keys. In
/// cluster mode keys are spread over nodes by hash slot and a command whose
/// keys live in different slots fails with [`StoreError::CrossSlot`].
#[derive(Debug)]
pub struct MemoryStore {
    nodes: Vec<Mutex<Keyspace>>,
    clustered: bool,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// Single-node store
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { nodes: vec![Mutex::new(Keyspace::default())], clustered: false, clock }
    }

    /// Store that shards hash slots over `nodes` nodes
    pub fn cluster(nodes: usize, clock: Arc<dyn Clock>) -> Self {
        let nodes = (0..nodes.max(1)).map(|_| Mutex::new(Keyspace::default())).collect();
        Self { nodes, clustered: true, clock }
    }

    pub fn is_clustered(&self) -> bool {
        self.clustered
    }

    fn node_index(&self, keys: &[&str]) -> StoreResult<usize> {
        if !self.clustered {
            return Ok(0);
        }
        let mut slots = keys.iter().map(|k| hash_slot(k));
        let Some(first) = slots.next() else {
            return Ok(0);
        };
        if slots.any(|slot| slot != first) {
            let keys = keys.iter().map(|k| k.to_string()).collect();
            return Err(StoreError::CrossSlot { keys });
        }
        Ok(usize::from(first) * self.nodes.len() / usize::from(HASH_SLOTS))
    }

    fn lock(&self, keys: &[&str]) -> StoreResult<MutexGuard<'_, Keyspace>> {
        let index = self.node_index(keys)?;
        self.nodes
            .get(index)
            .ok_or_else(|| StoreError::Unavailable(format!("no node for slot index {index}")))?
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store node lock poisoned".to_string()))
    }

    /// Whether a key exists and has not expired
    pub fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        Ok(self.lock(&[key])?.get(key, now).is_some())
    }

    /// Remaining time to live in milliseconds; `None` when the key is missing or persistent
    pub fn ttl_ms(&self, key: &str) -> StoreResult<Option<u64>> {
        let now = self.clock.now_ms();
        let entry = self.lock(&[key])?.get(key, now);
        Ok(entry.and_then(|e| e.expires_at_ms).map(|at| at.saturating_sub(now)))
    }

    /// Integer value of a counter key
    pub fn counter(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = self.clock.now_ms();
        Ok(self.lock(&[key])?.get(key, now).and_then(|e| match e.value {
            Value::Counter(v) => Some(v),
            _ => None,
        }))
    }

    pub fn set_counter(&self, key: &str, value: i64, ttl_ms: Option<u64>) -> StoreResult<()> {
        let now = self.clock.now_ms();
        self.lock(&[key])?.set(key, Value::Counter(value), ttl_ms, now);
        Ok(())
    }

    pub fn set_flag(&self, key: &str, ttl_ms: Option<u64>) -> StoreResult<()> {
        let now = self.clock.now_ms();
        self.lock(&[key])?.set(key, Value::Flag, ttl_ms, now);
        Ok(())
    }

    /// Number of live keys across all nodes
    pub fn len(&self) -> StoreResult<usize> {
        let now = self.clock.now_ms();
        let mut total = 0;
        for node in &self.nodes {
            let guard = node.lock().map_err(|_| {
                StoreError::Unavailable("memory store node lock poisoned".to_string())
            })?;
            total += guard
                .entries
                .values()
                .filter(|e| e.expires_at_ms.is_none_or(|at| at > now))
                .count();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1000)
}

#[async_trait]
impl Store for MemoryStore {
    async fn take(&self, key: &str, limits: &ScriptLimits, count: i64) -> StoreResult<Outcome> {
        let now = self.clock.now_ms();
        let mut node = self.lock(&[key])?;
        let state = node.bucket(key, now);
        let (outcome, next) = script::take(state.as_ref(), limits, count, now);
        if let Some(next) = next {
            node.set(key, Value::Bucket(next), Some(secs_to_ms(limits.ttl_secs)), now);
        }
        Ok(outcome)
    }

    async fn take_exponential(
        &self,
        key: &str,
        limits: &ScriptLimits,
        count: i64,
        backoff: Backoff,
    ) -> StoreResult<ExponentialOutcome> {
        let now = self.clock.now_ms();
        let mut node = self.lock(&[key])?;
        let state = node.bucket(key, now);
        let (outcome, next) = script::take_exponential(state.as_ref(), limits, count, backoff, now);
        if let Some(next) = next {
            node.set(key, Value::Bucket(next), Some(secs_to_ms(limits.ttl_secs)), now);
        }
        Ok(outcome)
    }

    async fn take_elevated(
        &self,
        keys: &ElevatedKeys,
        base: &ScriptLimits,
        erl: Option<&ErlLimits>,
        count: i64,
    ) -> StoreResult<ElevatedOutcome> {
        let now = self.clock.now_ms();
        let mut node = self.lock(&[
            keys.bucket.as_str(),
            keys.erl_is_active.as_str(),
            keys.erl_quota.as_str(),
        ])?;

        let snapshot = ErlSnapshot {
            bucket: node.bucket(&keys.bucket, now),
            active: node.get(&keys.erl_is_active, now).is_some(),
            quota_used: node.get(&keys.erl_quota, now).and_then(|e| match e.value {
                Value::Counter(v) => Some(v),
                _ => None,
            }),
        };

        let (outcome, writes) = script::take_elevated(&snapshot, base, erl, count, now);

        if let Some((state, ttl_secs)) = writes.bucket {
            node.set(&keys.bucket, Value::Bucket(state), Some(secs_to_ms(ttl_secs)), now);
        }
        if let Some(secs) = writes.activate_for_secs {
            node.set(&keys.erl_is_active, Value::Flag, Some(secs_to_ms(secs)), now);
        }
        if let Some(quota) = writes.quota {
            match quota.expire_at_ms {
                Some(at) => node.set(
                    &keys.erl_quota,
                    Value::Counter(quota.value),
                    Some(at.saturating_sub(now)),
                    now,
                ),
                None => node.set_keep_ttl(&keys.erl_quota, Value::Counter(quota.value), now),
            }
        }
        if outcome.triggered {
            debug!(
                key = %keys.bucket,
                quota_remaining = outcome.quota_remaining,
                "Elevated limits activated"
            );
        }
        Ok(outcome)
    }

    async fn put(&self, key: &str, limits: &ScriptLimits, count: i64) -> StoreResult<Outcome> {
        let now = self.clock.now_ms();
        let mut node = self.lock(&[key])?;
        let state = node.bucket(key, now);
        let (outcome, next) = script::put(state.as_ref(), limits, count, now);
        node.set(key, Value::Bucket(next), Some(secs_to_ms(limits.ttl_secs)), now);
        Ok(outcome)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<BucketState>> {
        let now = self.clock.now_ms();
        Ok(self.lock(&[key])?.bucket(key, now))
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let now = self.clock.now_ms();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut node = self.lock(&refs)?;
        Ok(refs.iter().filter(|k| node.remove(k, now)).count() as u64)
    }

    async fn flush_all(&self) -> StoreResult<()> {
        for node in &self.nodes {
            node.lock()
                .map_err(|_| {
                    StoreError::Unavailable("memory store node lock poisoned".to_string())
                })?
                .entries
                .clear();
        }
        Ok(())
    }
}
