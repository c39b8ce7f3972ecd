//! Admission engine.
//!
//! # Architecture
//!
//! ```text
//!  BucketRequest
//!       │
//!       ▼
//!  validation ──► resolver (per-call override / exact / regex / base)
//!       │
//!       ▼
//!  unlimited? ──yes──► answer locally
//!       │
//!       ▼
//!  skip cache ──hit──► answer from the last store result
//!       │
//!       ▼
//!  Store::take* ──► script (runs atomically inside the store)
//! ```
//!
//! Bucket types live behind an [`ArcSwap`] so reconfiguration never blocks
//! calls in flight; each call works on the snapshot it loaded.

pub mod params;
pub mod script;
mod skip_cache;
pub mod validation;
mod wait;

pub use params::{
    BucketRequest, BucketSnapshot, Count, ElevatedLimitsResult, ErlParams, TakeElevatedResult,
    TakeExponentialResult, TakeResult,
};
pub use skip_cache::{SkipCache, SkipDecision, SKIP_CACHE_SIZE};
pub use wait::WaitOptions;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::bucket::{build_bucket, build_buckets, resolve, BucketParams, BucketType};
use crate::config::{validate_bucket, BucketSpec, EngineConfig, DEFAULT_GLOBAL_TTL_SECS};
use crate::error::{ConfigError, Result, StoreError, ValidationError};
use crate::keys::{bucket_key, replicate_hashtag};
use crate::store::{Clock, ElevatedKeys, Store, StoreResult, SystemClock};
use crate::telemetry::metrics::values;
use crate::telemetry::Metrics;
use script::{end_of_utc_month_ms, full_at_ms, BucketState, ErlLimits, Outcome, ScriptLimits};
use validation::{
    fixed_window_enabled, resolve_count, resolve_erl_params, resolve_take_count, validate_request,
    ResolvedErlParams,
};

type BucketRegistry = AHashMap<String, Arc<BucketType>>;

/// Validated request with its effective parameters
struct Resolved {
    bucket: Arc<BucketType>,
    params: Arc<BucketParams>,
    /// `{type}:{key}` without the store prefix
    logical_key: String,
    store_key: String,
}

/// Distributed rate limiter over a [`Store`]
pub struct BucketDb {
    buckets: ArcSwap<BucketRegistry>,
    store: Arc<dyn Store>,
    prefix: String,
    global_ttl_secs: u64,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    take_calls: SkipCache<TakeResult>,
    elevated_calls: SkipCache<TakeElevatedResult>,
}

pub struct BucketDbBuilder {
    store: Arc<dyn Store>,
    buckets: BTreeMap<String, BucketSpec>,
    prefix: String,
    global_ttl_secs: u64,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl BucketDbBuilder {
    pub fn buckets(mut self, buckets: BTreeMap<String, BucketSpec>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn bucket(mut self, name: impl Into<String>, spec: BucketSpec) -> Self {
        self.buckets.insert(name.into(), spec);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn global_ttl(mut self, ttl: Duration) -> Self {
        self.global_ttl_secs = ttl.as_secs().max(1);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<BucketDb> {
        if self.buckets.is_empty() {
            return Err(ConfigError::NoBuckets.into());
        }
        for (name, spec) in &self.buckets {
            validate_bucket(name, spec)?;
        }
        let registry = build_buckets(&self.buckets, self.clock.now_ms())?;
        info!(buckets = registry.len(), prefix = %self.prefix, "Bucket configuration applied");

        Ok(BucketDb {
            buckets: ArcSwap::from_pointee(registry),
            store: self.store,
            prefix: self.prefix,
            global_ttl_secs: self.global_ttl_secs,
            clock: self.clock,
            metrics: self.metrics,
            take_calls: SkipCache::default(),
            elevated_calls: SkipCache::default(),
        })
    }
}

fn reset_secs(reset_ms: u64) -> u64 {
    reset_ms.div_ceil(1000)
}

impl BucketDb {
    pub fn builder(store: Arc<dyn Store>) -> BucketDbBuilder {
        BucketDbBuilder {
            store,
            buckets: BTreeMap::new(),
            prefix: String::new(),
            global_ttl_secs: DEFAULT_GLOBAL_TTL_SECS,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Builds an engine from a loaded configuration
    pub fn new(config: EngineConfig, store: Arc<dyn Store>) -> Result<Self> {
        Self::builder(store)
            .buckets(config.buckets)
            .prefix(config.prefix)
            .global_ttl(Duration::from_secs(config.global_ttl_secs))
            .build()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current definition of a bucket type
    pub fn bucket(&self, name: &str) -> Option<Arc<BucketType>> {
        self.buckets.load().get(name).cloned()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replaces every bucket type
    pub fn configure_buckets(&self, buckets: &BTreeMap<String, BucketSpec>) -> Result<()> {
        for (name, spec) in buckets {
            validate_bucket(name, spec)?;
        }
        let registry = build_buckets(buckets, self.clock.now_ms())?;
        info!(buckets = registry.len(), "Bucket configuration replaced");
        self.buckets.store(Arc::new(registry));
        Ok(())
    }

    /// Adds or replaces one bucket type, overrides included
    pub fn configure_bucket(&self, name: &str, spec: &BucketSpec) -> Result<()> {
        validate_bucket(name, spec)?;
        let bucket = Arc::new(build_bucket(name, spec, self.clock.now_ms())?);
        self.buckets.rcu(|current| {
            let mut next = BucketRegistry::clone(current);
            next.insert(name.to_string(), Arc::clone(&bucket));
            next
        });
        info!(bucket = %name, "Bucket configuration applied");
        Ok(())
    }

    /// Store keys of the elevated limit state for a bucket key
    pub fn erl_keys(
        &self,
        bucket_type: &str,
        key: &str,
        active_name: &str,
        quota_name: &str,
    ) -> ElevatedKeys {
        let logical = bucket_key(bucket_type, key);
        let aux = |name: &str| {
            format!("{}{}", self.prefix, replicate_hashtag(&logical, &self.prefix, name))
        };
        ElevatedKeys {
            bucket: format!("{}{logical}", self.prefix),
            erl_is_active: aux(active_name),
            erl_quota: aux(quota_name),
        }
    }

    fn resolve(&self, request: &BucketRequest) -> Result<Resolved> {
        let registry = self.buckets.load();
        let bucket = validate_request(request, &registry)?;
        let params = resolve(&bucket, &request.key, request.config_override.as_ref());
        let logical_key = bucket_key(&request.bucket_type, &request.key);
        let store_key = format!("{}{logical_key}", self.prefix);
        Ok(Resolved { bucket, params, logical_key, store_key })
    }

    fn script_limits(&self, params: &BucketParams, request: &BucketRequest) -> ScriptLimits {
        let fixed_window = fixed_window_enabled(params, request.fixed_window);
        ScriptLimits::new(&params.limits, fixed_window, self.global_ttl_secs)
    }

    fn unlimited_result(&self, params: &BucketParams) -> TakeResult {
        TakeResult {
            conformant: true,
            remaining: params.size(),
            reset: reset_secs(self.clock.now_ms()),
            limit: params.size(),
            delta_reset_ms: 0,
            delayed: false,
        }
    }

    fn take_result(outcome: &Outcome, limit: i64) -> TakeResult {
        TakeResult {
            conformant: outcome.conformant,
            remaining: outcome.remaining_tokens(),
            reset: reset_secs(outcome.reset_ms),
            limit,
            delta_reset_ms: outcome.reset_ms.saturating_sub(outcome.now_ms),
            delayed: false,
        }
    }

    async fn call_store<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        let result = call.await;
        if let Some(metrics) = &self.metrics {
            metrics.record_store_duration(operation, started.elapsed().as_secs_f64());
        }
        result.map_err(|e| {
            warn!(operation, error = %e, "Store call failed");
            if let Some(metrics) = &self.metrics {
                metrics.record_store_error(operation);
            }
            e.into()
        })
    }

    fn record_take(&self, bucket_type: &str, operation: &str, conformant: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_take(bucket_type, operation, conformant);
        }
    }

    fn record_skip_hit(&self, bucket_type: &str, key: &str) {
        trace!(bucket = %bucket_type, key, "Answered from skip cache");
        if let Some(metrics) = &self.metrics {
            metrics.record_skip_cache_hit(bucket_type);
        }
    }

    /// Takes `count` tokens (default 1) if available
    pub async fn take(&self, request: &BucketRequest) -> Result<TakeResult> {
        let resolved = self.resolve(request)?;
        let params = &resolved.params;
        let bucket_type = resolved.bucket.name.as_str();

        if params.unlimited {
            self.record_take(bucket_type, values::OP_TAKE, true);
            return Ok(self.unlimited_result(params));
        }

        let count = resolve_take_count(request.count, params.size())?;
        let count = match self.take_calls.check(&resolved.logical_key, params.skip_n_calls, count) {
            SkipDecision::Cached(result) => {
                self.record_skip_hit(bucket_type, &request.key);
                return Ok(result);
            }
            SkipDecision::Fetch { count } => count,
        };

        let limits = self.script_limits(params, request);
        let outcome = self
            .call_store(values::OP_TAKE, self.store.take(&resolved.store_key, &limits, count))
            .await?;
        let result = Self::take_result(&outcome, params.size());

        debug!(
            bucket = %bucket_type,
            key = %request.key,
            conformant = result.conformant,
            remaining = result.remaining,
            "take"
        );
        self.record_take(bucket_type, values::OP_TAKE, result.conformant);
        self.take_calls.record(&resolved.logical_key, params.skip_n_calls, &result);
        Ok(result)
    }

    /// Take that reports an escalating backoff on consecutive rejections
    pub async fn take_exponential(&self, request: &BucketRequest) -> Result<TakeExponentialResult> {
        let resolved = self.resolve(request)?;
        let params = &resolved.params;
        let bucket_type = resolved.bucket.name.as_str();

        let backoff = params.backoff.ok_or_else(|| ValidationError::BackoffNotConfigured {
            bucket_type: bucket_type.to_string(),
        })?;

        if params.unlimited {
            self.record_take(bucket_type, values::OP_TAKE_EXPONENTIAL, true);
            return Ok(TakeExponentialResult {
                take: self.unlimited_result(params),
                backoff_factor: backoff.factor,
                backoff_time: 0,
                attempt: 0,
            });
        }

        let count = resolve_take_count(request.count, params.size())?;
        let limits = self.script_limits(params, request);
        let outcome = self
            .call_store(
                values::OP_TAKE_EXPONENTIAL,
                self.store.take_exponential(&resolved.store_key, &limits, count, backoff),
            )
            .await?;

        let result = TakeExponentialResult {
            take: Self::take_result(&outcome.outcome, params.size()),
            backoff_factor: backoff.factor,
            backoff_time: outcome.backoff_time_ms,
            attempt: outcome.attempt,
        };
        debug!(
            bucket = %bucket_type,
            key = %request.key,
            conformant = result.take.conformant,
            attempt = result.attempt,
            backoff_time = result.backoff_time,
            "take_exponential"
        );
        self.record_take(bucket_type, values::OP_TAKE_EXPONENTIAL, result.take.conformant);
        Ok(result)
    }

    /// Take with elevated rate limits.
    ///
    /// Without `elevated_limits` in the request, or on a bucket without a
    /// complete elevated definition, this behaves like [`BucketDb::take`].
    pub async fn take_elevated(&self, request: &BucketRequest) -> Result<TakeElevatedResult> {
        let resolved = self.resolve(request)?;
        let params = &resolved.params;
        let bucket_type = resolved.bucket.name.as_str();

        let erl_params = match &request.elevated_limits {
            Some(erl) => Some(resolve_erl_params(erl, params)?),
            None => None,
        };
        let configured = erl_params.is_some() && params.is_erl_configured();
        let erl_params = erl_params.unwrap_or_default();

        if params.unlimited {
            self.record_take(bucket_type, values::OP_TAKE_ELEVATED, true);
            return Ok(TakeElevatedResult {
                take: self.unlimited_result(params),
                elevated_limits: ElevatedLimitsResult {
                    erl_configured_for_bucket: configured,
                    triggered: false,
                    activated: false,
                    quota_remaining: erl_params.quota,
                    quota_allocated: erl_params.quota,
                    erl_activation_period_seconds: erl_params.activation_period_secs,
                },
            });
        }

        let count = resolve_take_count(request.count, params.size())?;
        let count =
            match self.elevated_calls.check(&resolved.logical_key, params.skip_n_calls, count) {
                SkipDecision::Cached(result) => {
                    self.record_skip_hit(bucket_type, &request.key);
                    return Ok(result);
                }
                SkipDecision::Fetch { count } => count,
            };

        let base = self.script_limits(params, request);
        let erl = self.erl_limits(params, request, &erl_params, configured);
        let keys = self.erl_keys(
            &request.bucket_type,
            &request.key,
            &erl_params.erl_is_active_key,
            &erl_params.erl_quota_key,
        );

        let outcome = self
            .call_store(
                values::OP_TAKE_ELEVATED,
                self.store.take_elevated(&keys, &base, erl.as_ref(), count),
            )
            .await?;

        let result = TakeElevatedResult {
            take: Self::take_result(&outcome.outcome, outcome.limit),
            elevated_limits: ElevatedLimitsResult {
                erl_configured_for_bucket: configured,
                triggered: outcome.triggered,
                activated: outcome.activated && configured,
                quota_remaining: outcome.quota_remaining,
                quota_allocated: erl_params.quota,
                erl_activation_period_seconds: erl_params.activation_period_secs,
            },
        };

        if result.elevated_limits.triggered {
            info!(
                bucket = %bucket_type,
                key = %request.key,
                quota_remaining = result.elevated_limits.quota_remaining,
                "Elevated rate limits triggered"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_erl_triggered(bucket_type);
            }
        }
        debug!(
            bucket = %bucket_type,
            key = %request.key,
            conformant = result.take.conformant,
            remaining = result.take.remaining,
            activated = result.elevated_limits.activated,
            "take_elevated"
        );
        self.record_take(bucket_type, values::OP_TAKE_ELEVATED, result.take.conformant);
        self.elevated_calls.record(&resolved.logical_key, params.skip_n_calls, &result);
        Ok(result)
    }

    fn erl_limits(
        &self,
        params: &BucketParams,
        request: &BucketRequest,
        erl_params: &ResolvedErlParams,
        configured: bool,
    ) -> Option<ErlLimits> {
        let elevated = params.elevated.as_ref().filter(|_| configured)?;
        let fixed_window = fixed_window_enabled(params, request.fixed_window);
        Some(ErlLimits {
            limits: ScriptLimits::new(&elevated.limits, fixed_window, self.global_ttl_secs),
            activation_period_secs: erl_params.activation_period_secs,
            quota: erl_params.quota,
            quota_expire_at_ms: end_of_utc_month_ms(self.clock.now_ms()),
        })
    }

    /// Returns tokens to a bucket; `count` defaults to the full size
    pub async fn put(&self, request: &BucketRequest) -> Result<BucketSnapshot> {
        let resolved = self.resolve(request)?;
        let params = &resolved.params;

        if params.unlimited {
            return Ok(BucketSnapshot {
                remaining: params.size(),
                reset: reset_secs(self.clock.now_ms()),
                limit: params.size(),
            });
        }

        let count = resolve_count(request.count, params.size(), params.size()).min(params.size());
        let limits = self.script_limits(params, request);
        let outcome = self
            .call_store(values::OP_PUT, self.store.put(&resolved.store_key, &limits, count))
            .await?;

        debug!(
            bucket = %resolved.bucket.name,
            key = %request.key,
            count,
            remaining = outcome.remaining_tokens(),
            "put"
        );
        Ok(BucketSnapshot {
            remaining: outcome.remaining_tokens(),
            reset: reset_secs(outcome.reset_ms),
            limit: params.size(),
        })
    }

    /// Refills a bucket completely
    pub async fn reset(&self, request: &BucketRequest) -> Result<BucketSnapshot> {
        let request = BucketRequest { count: None, ..request.clone() };
        self.put(&request).await
    }

    /// Reads a bucket without modifying it
    pub async fn get(&self, request: &BucketRequest) -> Result<BucketSnapshot> {
        let resolved = self.resolve(request)?;
        let params = &resolved.params;

        if params.unlimited {
            return Ok(BucketSnapshot {
                remaining: params.size(),
                reset: reset_secs(self.clock.now_ms()),
                limit: params.size(),
            });
        }

        let state = self.call_store(values::OP_GET, self.store.get(&resolved.store_key)).await?;
        let state = state.unwrap_or(BucketState {
            remaining: params.size() as f64,
            last_drip_ms: self.clock.now_ms(),
            attempts: 0,
        });
        let reset = match params.refill() {
            Some(_) => reset_secs(full_at_ms(&state, &self.script_limits(params, request))),
            None => 0,
        };

        Ok(BucketSnapshot {
            remaining: state.remaining.floor() as i64,
            reset,
            limit: params.size(),
        })
    }

    /// Deletes raw keys (the store prefix is applied) in one command
    pub async fn del(&self, keys: &[&str]) -> Result<u64> {
        let store_keys: Vec<String> = keys.iter().map(|k| format!("{}{k}", self.prefix)).collect();
        let caller_keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let started = Instant::now();
        let result = self.store.del(&store_keys).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_store_duration(values::OP_DEL, started.elapsed().as_secs_f64());
        }
        result.map_err(|e| {
            warn!(keys = %caller_keys.join(","), error = %e, "Delete failed");
            if let Some(metrics) = &self.metrics {
                metrics.record_store_error(values::OP_DEL);
            }
            delete_error(caller_keys, e).into()
        })
    }

    /// Drops every key in the store and the local skip caches
    pub async fn reset_all(&self) -> Result<()> {
        self.call_store(values::OP_RESET_ALL, self.store.flush_all()).await?;
        self.take_calls.clear();
        self.elevated_calls.clear();
        info!("All buckets reset");
        Ok(())
    }
}

fn delete_error(keys: Vec<String>, err: StoreError) -> StoreError {
    let reason = match &err {
        StoreError::CrossSlot { .. } => format!(
            "{err}\nYou are likely receiving this error because you are in a in clustered redis \
             environment. The keys you listed might be living in different clusters, which a \
             single DEL command cannot handle. Please try again by running the command \
             separately for each key instead."
        ),
        StoreError::DeleteFailed { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    StoreError::DeleteFailed { keys, reason }
}
