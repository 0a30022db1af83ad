//! Distributed semaphore: caps concurrent in-flight work.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::method::{at_millis, MethodContext};
use crate::error::{Result, ThrottleError};
use crate::store::CounterStore;

/// Allows at most `permit_limit` holders at once.
///
/// A holder that never releases frees its slot after `timeout_seconds`. With
/// `release_after_seconds > 0` the release is deferred, which blocks re-entry
/// for a cool-down period after the work completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Semaphore {
    pub permit_limit: i64,
    pub timeout_seconds: i64,
    pub release_after_seconds: i64,
    pub should_throw_on_failures: bool,
}

impl Semaphore {
    pub fn new(permit_limit: i64, timeout_seconds: i64) -> Self {
        Self {
            permit_limit,
            timeout_seconds,
            release_after_seconds: 0,
            should_throw_on_failures: false,
        }
    }

    pub fn with_release_after(mut self, seconds: i64) -> Self {
        self.release_after_seconds = seconds;
        self
    }

    pub fn with_throw_on_failures(mut self, should_throw: bool) -> Self {
        self.should_throw_on_failures = should_throw;
        self
    }

    pub fn retry_after_seconds(&self) -> u64 {
        if self.release_after_seconds > 0 {
            self.release_after_seconds as u64
        } else {
            1
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout_seconds <= 0 {
            return Err(ThrottleError::InvalidMethod(
                "Semaphore: timeout_seconds must be positive".to_string(),
            ));
        }
        if self.release_after_seconds < 0 {
            return Err(ThrottleError::InvalidMethod(
                "Semaphore: release_after_seconds must not be negative".to_string(),
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
        let expires_at = at_millis(ctx.now_millis() + self.timeout_seconds * 1000);
        let count = store
            .increment_and_get(key, cost, expires_at, self.permit_limit)
            .await?;
        let remaining = self.permit_limit - count;

        if remaining < 0 {
            debug!(key = %key, count = count, limit = self.permit_limit, "Semaphore full");
            // Give back the slot this call provisionally claimed
            store.decrement(key, cost).await?;
        } else {
            trace!(key = %key, count = count, "Semaphore acquired");
        }
        Ok(remaining)
    }

    pub(crate) async fn is_still_exceeded(
        &self,
        key: &str,
        store: &dyn CounterStore,
    ) -> Result<bool> {
        Ok(store.get(key).await? >= self.permit_limit)
    }

    pub(crate) async fn decrement(
        &self,
        key: &str,
        cost: i64,
        store: &dyn CounterStore,
    ) -> Result<()> {
        trace!(key = %key, cost = cost, "Semaphore released");
        store.decrement(key, cost).await
    }

    /// Release after `release_after_seconds` on a background task.
    pub(crate) fn spawn_deferred_release(
        &self,
        key: String,
        cost: i64,
        store: Arc<dyn CounterStore>,
    ) {
        let delay = Duration::from_secs(self.release_after_seconds.max(0) as u64);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = store.decrement(&key, cost).await {
                warn!(key = %key, error = %e, "Deferred semaphore release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::ratelimit::circuit_breaker::TrialRegistry;
    use crate::store::MemoryCounterStore;

    fn setup() -> (ManualClock, Arc<MemoryCounterStore>, MethodContext) {
        let clock = ManualClock::new(1_700_000_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryCounterStore::with_clock(shared.clone()));
        let ctx = MethodContext::new(shared, Arc::new(TrialRegistry::new()));
        (clock, store, ctx)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (_clock, store, ctx) = setup();
        let method = Semaphore::new(2, 10);

        assert_eq!(assert_ok!(method.is_exceeded("k", 1, store.as_ref(), &ctx).await), 1);
        assert_eq!(assert_ok!(method.is_exceeded("k", 1, store.as_ref(), &ctx).await), 0);
        assert!(assert_ok!(method.is_exceeded("k", 1, store.as_ref(), &ctx).await) < 0);

        // The rejected call gave its slot back
        assert_eq!(store.get("k").await.unwrap(), 2);
        assert!(method.is_still_exceeded("k", store.as_ref()).await.unwrap());

        assert_ok!(method.decrement("k", 1, store.as_ref()).await);
        assert!(!method.is_still_exceeded("k", store.as_ref()).await.unwrap());
        assert_eq!(assert_ok!(method.is_exceeded("k", 1, store.as_ref(), &ctx).await), 0);
    }

    #[tokio::test]
    async fn test_forgotten_slot_heals_after_timeout() {
        let (clock, store, ctx) = setup();
        let method = Semaphore::new(1, 3);

        assert_eq!(method.is_exceeded("k", 1, store.as_ref(), &ctx).await.unwrap(), 0);

        clock.advance_secs(2);
        assert!(method.is_exceeded("k", 1, store.as_ref(), &ctx).await.unwrap() < 0);

        clock.advance_secs(1);
        assert_eq!(method.is_exceeded("k", 1, store.as_ref(), &ctx).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_release() {
        let (_clock, store, ctx) = setup();
        let method = Semaphore::new(1, 60).with_release_after(5);

        method.is_exceeded("k", 1, store.as_ref(), &ctx).await.unwrap();
        method.spawn_deferred_release("k".to_string(), 1, store.clone());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.get("k").await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), 0);
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(Semaphore::new(1, 10).retry_after_seconds(), 1);
        assert_eq!(Semaphore::new(1, 10).with_release_after(7).retry_after_seconds(), 7);
    }
}
