//! Admission algorithms.
//!
//! Every function here is pure: it receives the current state of the keys a
//! call touches plus the store's notion of "now", and returns the response
//! together with the writes to apply. A [`Store`](crate::store::Store)
//! implementation runs one of these under whatever mechanism makes the
//! read-compute-write indivisible for the touched keys.
//!
//! # Refill
//!
//! ```text
//!  drip:          remaining = min(size, remaining + elapsed_ms * per_interval / interval)
//!  fixed window:  remaining = size once `interval` has elapsed since the window start
//! ```
//!
//! Drip buckets stamp `last_drip_ms = now` on every write; fixed-window
//! buckets keep the window start and only move it forward by whole intervals.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};

use crate::bucket::{Backoff, BucketLimits};

/// Persisted state of one bucket key
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens left; fractional so partial drips accrue between calls
    pub remaining: f64,
    /// Last drip instant, or window start in fixed-window mode
    pub last_drip_ms: u64,
    /// Consecutive rejections, used by the exponential variant
    pub attempts: u32,
}

/// The numbers a script runs against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptLimits {
    pub size: i64,
    pub tokens_per_ms: f64,
    pub drip_interval_ms: f64,
    /// Window length when fixed-window refill is on, otherwise 0
    pub fixed_window_ms: u64,
    /// Expiry applied to the bucket key on every write
    pub ttl_secs: u64,
}

impl ScriptLimits {
    pub fn new(limits: &BucketLimits, fixed_window: bool, global_ttl_secs: u64) -> Self {
        let refill = limits.refill;
        Self {
            size: limits.size,
            tokens_per_ms: refill.map_or(0.0, |r| r.tokens_per_ms()),
            drip_interval_ms: refill.map_or(0.0, |r| r.drip_interval_ms()),
            fixed_window_ms: match refill {
                Some(r) if fixed_window => r.interval_ms,
                _ => 0,
            },
            ttl_secs: limits.ttl_secs.unwrap_or(global_ttl_secs).max(1),
        }
    }
}

/// Result of a take or put
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub conformant: bool,
    pub remaining: f64,
    /// Store time the script ran at
    pub now_ms: u64,
    /// Instant the bucket is expected to be full again
    pub reset_ms: u64,
}

impl Outcome {
    /// Remaining tokens as reported to callers
    pub fn remaining_tokens(&self) -> i64 {
        self.remaining.floor() as i64
    }
}

/// Returns the refilled token count and the timestamp to persist.
fn refill(state: Option<&BucketState>, limits: &ScriptLimits, now_ms: u64) -> (f64, u64) {
    let size = limits.size as f64;
    let Some(state) = state else {
        return (size, now_ms);
    };

    if limits.fixed_window_ms > 0 {
        let elapsed = now_ms.saturating_sub(state.last_drip_ms);
        if elapsed >= limits.fixed_window_ms {
            let windows = elapsed / limits.fixed_window_ms;
            return (size, state.last_drip_ms + windows * limits.fixed_window_ms);
        }
        return (state.remaining.min(size), state.last_drip_ms);
    }

    let elapsed = now_ms.saturating_sub(state.last_drip_ms) as f64;
    let dripped = state.remaining + elapsed * limits.tokens_per_ms;
    (dripped.min(size), now_ms)
}

fn reset_at(remaining: f64, window_start_ms: u64, limits: &ScriptLimits, now_ms: u64) -> u64 {
    let missing = limits.size as f64 - remaining;
    if missing <= 0.0 {
        return now_ms;
    }
    if limits.fixed_window_ms > 0 {
        return window_start_ms + limits.fixed_window_ms;
    }
    now_ms + (missing * limits.drip_interval_ms).ceil() as u64
}

/// Instant a stored bucket is full again, counted from its last write.
pub fn full_at_ms(state: &BucketState, limits: &ScriptLimits) -> u64 {
    reset_at(state.remaining, state.last_drip_ms, limits, state.last_drip_ms)
}

/// Token bucket take. A zero count reports the refilled state and writes nothing.
pub fn take(
    state: Option<&BucketState>,
    limits: &ScriptLimits,
    count: i64,
    now_ms: u64,
) -> (Outcome, Option<BucketState>) {
    let (mut remaining, last) = refill(state, limits, now_ms);

    if count == 0 {
        let outcome = Outcome {
            conformant: true,
            remaining,
            now_ms,
            reset_ms: reset_at(remaining, last, limits, now_ms),
        };
        return (outcome, None);
    }

    let conformant = remaining >= count as f64;
    if conformant {
        remaining -= count as f64;
    }

    let next = BucketState {
        remaining,
        last_drip_ms: last,
        attempts: state.map_or(0, |s| s.attempts),
    };
    let outcome = Outcome {
        conformant,
        remaining,
        now_ms,
        reset_ms: reset_at(remaining, last, limits, now_ms),
    };
    (outcome, Some(next))
}

/// Adds `count` tokens (negative drains), capped at size.
pub fn put(
    state: Option<&BucketState>,
    limits: &ScriptLimits,
    count: i64,
    now_ms: u64,
) -> (Outcome, BucketState) {
    let (remaining, last) = refill(state, limits, now_ms);
    let remaining = (remaining + count as f64).min(limits.size as f64);
    let next = BucketState {
        remaining,
        last_drip_ms: last,
        attempts: state.map_or(0, |s| s.attempts),
    };
    let outcome = Outcome {
        conformant: true,
        remaining,
        now_ms,
        reset_ms: reset_at(remaining, last, limits, now_ms),
    };
    (outcome, next)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialOutcome {
    pub outcome: Outcome,
    /// Exponent used for `backoff_time_ms`
    pub attempt: u32,
    pub backoff_time_ms: u64,
}

/// Take that escalates the suggested backoff on consecutive rejections.
pub fn take_exponential(
    state: Option<&BucketState>,
    limits: &ScriptLimits,
    count: i64,
    backoff: Backoff,
    now_ms: u64,
) -> (ExponentialOutcome, Option<BucketState>) {
    let (outcome, next) = take(state, limits, count, now_ms);
    let previous = state.map_or(0, |s| s.attempts);

    if outcome.conformant {
        // a zero count writes no tokens but still clears the escalation
        let next = next
            .or_else(|| state.filter(|_| previous > 0).copied())
            .map(|s| BucketState { attempts: 0, ..s });
        return (ExponentialOutcome { outcome, attempt: 0, backoff_time_ms: 0 }, next);
    }

    let exponent = previous.min(i32::MAX as u32) as i32;
    let backoff_time = backoff.multiple_unit * backoff.factor.powi(exponent);
    let next = next.map(|s| BucketState { attempts: previous.saturating_add(1), ..s });
    let result = ExponentialOutcome {
        outcome,
        attempt: previous,
        backoff_time_ms: backoff_time.min(u64::MAX as f64).round() as u64,
    };
    (result, next)
}

/// Elevated limits in effect for one call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErlLimits {
    pub limits: ScriptLimits,
    pub activation_period_secs: u64,
    /// Activations allowed this month
    pub quota: i64,
    /// Expiry of the quota counter when this call creates it
    pub quota_expire_at_ms: u64,
}

/// State of every key a take-elevated call touches
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ErlSnapshot {
    pub bucket: Option<BucketState>,
    pub active: bool,
    /// `None` when the quota counter does not exist yet
    pub quota_used: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaWrite {
    pub value: i64,
    /// Set when the counter is created; an existing counter keeps its expiry
    pub expire_at_ms: Option<u64>,
}

/// Writes produced by a take-elevated call
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ErlWrites {
    pub bucket: Option<(BucketState, u64)>,
    /// Set or refresh the active flag for this many seconds
    pub activate_for_secs: Option<u64>,
    pub quota: Option<QuotaWrite>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElevatedOutcome {
    pub outcome: Outcome,
    /// Capacity the response is measured against
    pub limit: i64,
    pub triggered: bool,
    pub activated: bool,
    /// Quota left after this call, -1 while already active
    pub quota_remaining: i64,
}

/// Take with the elevated rate limit state machine.
///
/// `erl` is `None` when elevated limits are not configured for the bucket; the
/// call then behaves as a plain take and any active flag is ignored.
pub fn take_elevated(
    snapshot: &ErlSnapshot,
    base: &ScriptLimits,
    erl: Option<&ErlLimits>,
    count: i64,
    now_ms: u64,
) -> (ElevatedOutcome, ErlWrites) {
    let state = snapshot.bucket.as_ref();

    let Some(erl) = erl else {
        let (outcome, next) = take(state, base, count, now_ms);
        let writes =
            ErlWrites { bucket: next.map(|s| (s, base.ttl_secs)), ..ErlWrites::default() };
        let result = ElevatedOutcome {
            outcome,
            limit: base.size,
            triggered: false,
            activated: false,
            quota_remaining: 0,
        };
        return (result, writes);
    };

    if snapshot.active {
        let (outcome, next) = take(state, &erl.limits, count, now_ms);
        let writes = ErlWrites {
            bucket: next.map(|s| (s, erl.limits.ttl_secs)),
            activate_for_secs: Some(erl.activation_period_secs),
            quota: None,
        };
        let result = ElevatedOutcome {
            outcome,
            limit: erl.limits.size,
            triggered: false,
            activated: true,
            quota_remaining: -1,
        };
        return (result, writes);
    }

    let quota_used = snapshot.quota_used.unwrap_or(0);
    let (outcome, next) = take(state, base, count, now_ms);
    let not_triggered = |outcome: Outcome, next: Option<BucketState>| {
        let writes = ErlWrites { bucket: next.map(|s| (s, base.ttl_secs)), ..ErlWrites::default() };
        let result = ElevatedOutcome {
            outcome,
            limit: base.size,
            triggered: false,
            activated: false,
            quota_remaining: erl.quota - quota_used,
        };
        (result, writes)
    };

    if outcome.conformant || quota_used >= erl.quota {
        return not_triggered(outcome, next);
    }

    // tokens already spent from the base pool count against the elevated one
    let consumed = base.size as f64 - outcome.remaining;
    let elevated_remaining = erl.limits.size as f64 - consumed;
    if elevated_remaining < count as f64 {
        return not_triggered(outcome, next);
    }

    let remaining = elevated_remaining - count as f64;
    let last_drip_ms = next.map_or(now_ms, |s| s.last_drip_ms);
    let bucket = BucketState { remaining, last_drip_ms, attempts: 0 };
    let quota = QuotaWrite {
        value: quota_used + 1,
        expire_at_ms: snapshot.quota_used.is_none().then_some(erl.quota_expire_at_ms),
    };
    let writes = ErlWrites {
        bucket: Some((bucket, erl.limits.ttl_secs)),
        activate_for_secs: Some(erl.activation_period_secs),
        quota: Some(quota),
    };
    let outcome = Outcome {
        conformant: true,
        remaining,
        now_ms,
        reset_ms: reset_at(remaining, last_drip_ms, &erl.limits, now_ms),
    };
    let result = ElevatedOutcome {
        outcome,
        limit: erl.limits.size,
        triggered: true,
        activated: true,
        quota_remaining: erl.quota - quota.value,
    };
    (result, writes)
}

/// First instant of the next UTC calendar month, in epoch milliseconds.
pub fn end_of_utc_month_ms(now_ms: u64) -> u64 {
    let now = Utc.timestamp_millis_opt(now_ms as i64).single().unwrap_or_default();
    let (year, month) = match now.month() {
        12 => (now.year() + 1, 1),
        m => (now.year(), m + 1),
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(now_ms, |dt| dt.and_utc().timestamp_millis().max(0) as u64)
}
