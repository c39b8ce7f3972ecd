use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Keys tracked per engine instance
pub const SKIP_CACHE_SIZE: usize = 50;

#[derive(Debug, Clone)]
struct CallCount<T> {
    result: T,
    skipped: u32,
}

/// What to do with a call on a bucket that has `skip_n_calls` set
#[derive(Debug, Clone, PartialEq)]
pub enum SkipDecision<T> {
    /// Answer with the last store result
    Cached(T),
    /// Go to the store, taking `count` tokens
    Fetch { count: i64 },
}

/// Local cache that answers up to `skip_n_calls` calls per key from the last
/// store result, then charges the skipped calls on the next store round trip.
///
/// Per process and best effort: concurrent engine instances each keep their
/// own view.
#[derive(Debug)]
pub struct SkipCache<T> {
    calls: Mutex<LruCache<String, CallCount<T>>>,
}

impl<T: Clone> Default for SkipCache<T> {
    fn default() -> Self {
        Self::new(SKIP_CACHE_SIZE)
    }
}

impl<T: Clone> SkipCache<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { calls: Mutex::new(LruCache::new(capacity)) }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CallCount<T>>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Skip cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn check(&self, key: &str, skip_n_calls: u32, count: i64) -> SkipDecision<T> {
        if skip_n_calls == 0 {
            return SkipDecision::Fetch { count };
        }
        let mut calls = self.lock();
        match calls.get_mut(key) {
            Some(entry) if entry.skipped < skip_n_calls => {
                entry.skipped += 1;
                SkipDecision::Cached(entry.result.clone())
            }
            // settle the calls answered from cache since the last fetch
            Some(_) => SkipDecision::Fetch {
                count: count.saturating_mul(i64::from(skip_n_calls) + 1),
            },
            None => SkipDecision::Fetch { count },
        }
    }

    pub fn record(&self, key: &str, skip_n_calls: u32, result: &T) {
        if skip_n_calls == 0 {
            return;
        }
        self.lock().put(key.to_string(), CallCount { result: result.clone(), skipped: 0 });
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
