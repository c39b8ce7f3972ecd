use std::sync::Arc;
use tracing::{trace, warn};

use super::normalize::{normalize_temporals, BucketParams, BucketType};
use crate::config::TypeSpec;
use crate::keys::remove_hashtag;

/// Selects the effective parameters for one key.
///
/// Priority: a per-call override, then an exact-key override (matched with
/// one pair of outer braces removed), then a cached regex match, then the
/// first matching regex override, then the type itself.
pub fn resolve(
    bucket: &BucketType,
    key: &str,
    config_override: Option<&TypeSpec>,
) -> Arc<BucketParams> {
    if let Some(spec) = config_override {
        return Arc::new(normalize_temporals(spec));
    }

    if let Some(params) = bucket.overrides.get(remove_hashtag(key)) {
        return Arc::clone(params);
    }

    let Some(cache) = &bucket.overrides_cache else {
        return Arc::clone(&bucket.base);
    };

    let mut cache = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(bucket = %bucket.name, "Override cache lock poisoned, recovering");
            poisoned.into_inner()
        }
    };

    if let Some(params) = cache.get(key) {
        trace!(bucket = %bucket.name, key, "Override cache hit");
        return Arc::clone(params);
    }

    let matched = bucket
        .overrides_match
        .iter()
        .find(|(regex, _)| regex.is_match(key))
        .map(|(_, params)| Arc::clone(params));

    match matched {
        Some(params) => {
            cache.put(key.to_string(), Arc::clone(&params));
            params
        }
        None => Arc::clone(&bucket.base),
    }
}
