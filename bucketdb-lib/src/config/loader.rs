use std::fs;
use std::path::Path;

use crate::bucket::parse_until;
use crate::config::{BucketSpec, EngineConfig, LimitSpec, TypeSpec};
use crate::error::{ConfigError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<EngineConfig> {
    let txt = fs::read_to_string(p).map_err(|e| ConfigError::Load(e.to_string()))?;
    let cfg: EngineConfig = toml::from_str(&txt).map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &EngineConfig) -> Result<()> {
    if cfg.buckets.is_empty() {
        return Err(ConfigError::NoBuckets.into());
    }

    for (name, bucket) in &cfg.buckets {
        validate_bucket(name, bucket)?;
    }

    Ok(())
}

/// Checks one bucket type and its overrides
pub fn validate_bucket(name: &str, bucket: &BucketSpec) -> Result<()> {
    validate_type(name, &bucket.spec, true)?;

    for (override_name, ov) in &bucket.overrides {
        let label = format!("{name}.overrides.{override_name}");
        // an override may inherit capacity and rate from its parent
        validate_type(&label, &ov.spec, false)?;

        if let Some(until) = &ov.until {
            parse_until(&label, until)?;
        }
        if let Some(pattern) = &ov.pattern {
            regex::RegexBuilder::new(pattern).case_insensitive(true).build().map_err(|e| {
                ConfigError::InvalidRegex {
                    bucket: label.clone(),
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
    }

    Ok(())
}

fn validate_type(label: &str, spec: &TypeSpec, require_limits: bool) -> Result<()> {
    validate_limits(label, &spec.limits)?;

    if require_limits
        && !spec.unlimited
        && spec.limits.size.is_none()
        && spec.limits.per_interval.is_none()
        && spec.limits.shorthands().is_empty()
    {
        return Err(ConfigError::InvalidInterval {
            bucket: label.to_string(),
            reason: "a size, a refill rate, or unlimited = true is required".to_string(),
        }
        .into());
    }

    if let Some(elevated) = &spec.elevated_limits {
        validate_limits(&format!("{label}.elevated_limits"), &elevated.limits)?;
    }

    if let Some(backoff) = &spec.exponential_backoff {
        if backoff.backoff_factor < 1.0 || backoff.multiple_unit < 0.0 {
            return Err(ConfigError::InvalidInterval {
                bucket: label.to_string(),
                reason: "backoff_factor must be >= 1 and multiple_unit >= 0".to_string(),
            }
            .into());
        }
    }

    Ok(())
}

fn validate_limits(label: &str, limits: &LimitSpec) -> Result<()> {
    let shorthands = limits.shorthands();
    if shorthands.len() > 1 {
        let names: Vec<&str> = shorthands.iter().map(|(n, _)| *n).collect();
        return Err(ConfigError::InvalidInterval {
            bucket: label.to_string(),
            reason: format!("only one refill shorthand may be set, got {}", names.join(", ")),
        }
        .into());
    }
    if !shorthands.is_empty() && (limits.interval.is_some() || limits.per_interval.is_some()) {
        return Err(ConfigError::InvalidInterval {
            bucket: label.to_string(),
            reason: "interval/per_interval cannot be combined with a refill shorthand".to_string(),
        }
        .into());
    }
    if limits.interval == Some(0) {
        return Err(ConfigError::InvalidInterval {
            bucket: label.to_string(),
            reason: "interval must be > 0".to_string(),
        }
        .into());
    }
    if matches!(limits.size, Some(size) if size < 0) {
        return Err(ConfigError::InvalidInterval {
            bucket: label.to_string(),
            reason: "size must be >= 0".to_string(),
        }
        .into());
    }
    Ok(())
}
