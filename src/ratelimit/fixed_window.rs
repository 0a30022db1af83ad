//! Fixed window rate limiting.

use tracing::{debug, trace};

use super::method::{at_millis, window_end_millis, MethodContext};
use crate::error::{Result, ThrottleError};
use crate::store::CounterStore;

/// Allows `permit_limit` requests per wall-clock aligned window of
/// `interval_seconds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    pub permit_limit: i64,
    pub interval_seconds: i64,
    pub should_throw_on_failures: bool,
}

impl FixedWindow {
    pub fn new(permit_limit: i64, interval_seconds: i64) -> Self {
        Self {
            permit_limit,
            interval_seconds,
            should_throw_on_failures: false,
        }
    }

    pub fn with_throw_on_failures(mut self, should_throw: bool) -> Self {
        self.should_throw_on_failures = should_throw;
        self
    }

    pub fn retry_after_seconds(&self) -> u64 {
        self.interval_seconds.max(0) as u64
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval_seconds <= 0 {
            return Err(ThrottleError::InvalidMethod(
                "FixedWindow: interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) async fn is_exceeded(
        &self,
        key: &str,
        cost: i64,
        store: &dyn CounterStore,
        ctx: &MethodContext,
    ) -> Result<i64> {
        let now = ctx.now_millis();
        if ctx.markers.is_marked(key, now) {
            trace!(key = %key, "Window already exceeded");
            return Ok(-1);
        }

        let window_end = window_end_millis(now, self.interval_seconds);
        let count = store
            .increment_and_get(key, cost, at_millis(window_end), self.permit_limit)
            .await?;
        let remaining = self.permit_limit - count;

        trace!(key = %key, count = count, remaining = remaining, "Fixed window checked");
        if remaining < 0 {
            debug!(key = %key, count = count, limit = self.permit_limit, "Fixed window exceeded");
            ctx.markers.mark(key, window_end, now);
        }
        Ok(remaining)
    }

    pub(crate) async fn is_still_exceeded(
        &self,
        key: &str,
        store: &dyn CounterStore,
        ctx: &MethodContext,
    ) -> Result<bool> {
        if ctx.markers.is_marked(key, ctx.now_millis()) {
            return Ok(true);
        }
        Ok(store.get(key).await? >= self.permit_limit)
    }
}
