//! Sliding window rate limiting over fixed sub-window buckets.

use futures::future::join_all;
use tracing::{debug, trace};

use super::method::{at_millis, MethodContext};
use crate::error::{Result, ThrottleError};
use crate::store::CounterStore;

/// Approximates a moving window of `interval_seconds` by summing
/// `num_of_buckets` equal, wall-clock aligned buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    pub permit_limit: i64,
    pub interval_seconds: i64,
    pub num_of_buckets: i64,
    pub should_throw_on_failures: bool,
}

impl SlidingWindow {
    pub fn new(permit_limit: i64, interval_seconds: i64, num_of_buckets: i64) -> Self {
        Self {
            permit_limit,
            interval_seconds,
            num_of_buckets,
            should_throw_on_failures: false,
        }
    }

    pub fn with_throw_on_failures(mut self, should_throw: bool) -> Self {
        self.should_throw_on_failures = should_throw;
        self
    }

    fn bucket_seconds(&self) -> i64 {
        (self.interval_seconds / self.num_of_buckets.max(1)).max(1)
    }

    pub fn retry_after_seconds(&self) -> u64 {
        self.bucket_seconds() as u64
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ThrottleError::InvalidMethod(format!("SlidingWindow: {}", msg)));
        if self.interval_seconds <= 0 {
            return fail("interval_seconds must be positive");
        }
        if self.num_of_buckets <= 0 {
            return fail("num_of_buckets must be positive");
        }
        if self.num_of_buckets > self.interval_seconds {
            return fail("num_of_buckets must not exceed interval_seconds");
        }
        if self.interval_seconds % self.num_of_buckets != 0 {
            return fail("interval_seconds must be divisible by num_of_buckets");
        }
        Ok(())
    }

    /// Bucket index for the given instant, counted from the epoch.
    fn bucket_index(&self, now_millis: i64) -> i64 {
        now_millis.div_euclid(1000).div_euclid(self.bucket_seconds())
    }

    fn bucket_key(&self, key: &str, index: i64) -> String {
        format!("{}-{}", key, index.rem_euclid(self.num_of_buckets.max(1)))
    }

    fn other_bucket_keys(&self, key: &str, index: i64) -> Vec<String> {
        (1..self.num_of_buckets)
            .map(|back| self.bucket_key(key, index - back))
            .collect()
    }

    async fn sum_of(&self, keys: &[String], store: &dyn CounterStore) -> Result<i64> {
        let counts = join_all(keys.iter().map(|k| store.get(k))).await;
        let mut total = 0;
        for count in counts {
            total += count?;
        }
        Ok(total)
    }

    pub(crate) async fn is_exceeded(
        &self,
        key: &str,
        cost: i64,
        store: &dyn CounterStore,
        ctx: &MethodContext,
    ) -> Result<i64> {
        let now = ctx.now_millis();
        let index = self.bucket_index(now);
        let bucket_start = index * self.bucket_seconds();
        let expires_at = at_millis((bucket_start + self.interval_seconds) * 1000);

        // The current bucket is always counted, even when the read is skipped
        let current = store
            .increment_and_get(&self.bucket_key(key, index), cost, expires_at, self.permit_limit)
            .await?;

        if ctx.markers.is_marked(key, now) {
            trace!(key = %key, "Sliding window already exceeded");
            return Ok(-1);
        }

        let total = current + self.sum_of(&self.other_bucket_keys(key, index), store).await?;
        let remaining = self.permit_limit - total;

        trace!(key = %key, bucket = index, total = total, "Sliding window checked");
        if remaining < 0 {
            debug!(key = %key, total = total, limit = self.permit_limit, "Sliding window exceeded");
            let bucket_end = (bucket_start + self.bucket_seconds()) * 1000;
            ctx.markers.mark(key, bucket_end, now);
        }
        Ok(remaining)
    }

    pub(crate) async fn is_still_exceeded(
        &self,
        key: &str,
        store: &dyn CounterStore,
        ctx: &MethodContext,
    ) -> Result<bool> {
        let now = ctx.now_millis();
        if ctx.markers.is_marked(key, now) {
            return Ok(true);
        }
        let index = self.bucket_index(now);
        let mut keys = self.other_bucket_keys(key, index);
        keys.push(self.bucket_key(key, index));
        Ok(self.sum_of(&keys, store).await? >= self.permit_limit)
    }
}
