use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::params::{BucketRequest, TakeResult};
use super::validation::resolve_take_count;
use super::BucketDb;
use crate::bucket::Refill;
use crate::error::{LimitError, Result, ValidationError};

/// Bounds for [`BucketDb::wait`]
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Give up after this many retries and return the last rejection
    /// Default: None (retry until conformant)
    pub max_attempts: Option<u32>,
    /// Stops waiting with [`LimitError::Cancelled`]
    pub cancel: Option<CancellationToken>,
}

impl WaitOptions {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Time until `missing` tokens have dripped back
fn min_wait(missing: i64, refill: Refill) -> Duration {
    let ms =
        (missing.max(1) as f64 * refill.interval_ms as f64 / refill.per_interval as f64).ceil();
    Duration::from_millis(ms as u64)
}

impl BucketDb {
    /// Takes tokens, sleeping until the bucket can serve them.
    ///
    /// The result is marked `delayed` when at least one retry happened.
    pub async fn wait(&self, request: &BucketRequest, options: &WaitOptions) -> Result<TakeResult> {
        let params = self.resolve(request)?.params;
        let count = resolve_take_count(request.count, params.size())?;
        if !params.unlimited && count > params.size() {
            return Err(ValidationError::CountExceedsCapacity { count, size: params.size() }.into());
        }

        let mut attempts = 0u32;
        loop {
            let mut result = self.take(request).await?;
            result.delayed = attempts > 0;
            if result.conformant {
                return Ok(result);
            }

            // nothing ever drips back into a static bucket
            let Some(refill) = params.refill() else {
                return Ok(result);
            };
            if options.max_attempts.is_some_and(|max| attempts >= max) {
                return Ok(result);
            }

            let delay = min_wait(count - result.remaining, refill);
            attempts += 1;
            debug!(
                bucket = %request.bucket_type,
                key = %request.key,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Waiting for tokens"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_wait_retry(&request.bucket_type);
            }

            match &options.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(LimitError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_wait_rounds_up() {
        let refill = Refill { interval_ms: 1000, per_interval: 5 };
        assert_eq!(min_wait(3, refill), Duration::from_millis(600));
        let refill = Refill { interval_ms: 1000, per_interval: 3 };
        assert_eq!(min_wait(1, refill), Duration::from_millis(334));
    }
}
