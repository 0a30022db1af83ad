//! Circuit breaker over a failing dependency.
//!
//! A breaker is closed until `permit_limit` failures are recorded within one
//! `trial_interval_seconds` window. It then puts its key under trial, where
//! only `permit_limit` trial calls per interval get through, and closes again
//! on the first successful one. Failure and trial counts live in a private,
//! process-local store.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::{debug, info, trace};

use super::method::{at_millis, window_end_millis, MethodContext};
use crate::error::Result;
use crate::store::CounterStore;

/// Process-wide set of keys whose breaker is under trial.
#[derive(Debug, Default)]
pub struct TrialRegistry {
    under_trial: DashMap<String, bool>,
}

static GLOBAL_TRIALS: OnceLock<Arc<TrialRegistry>> = OnceLock::new();

impl TrialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every throttler in the process.
    pub fn global() -> Arc<TrialRegistry> {
        GLOBAL_TRIALS.get_or_init(|| Arc::new(TrialRegistry::new())).clone()
    }

    /// Returns `true` if the key was not under trial before.
    pub fn enter(&self, key: &str) -> bool {
        self.under_trial.insert(key.to_string(), true).is_none()
    }

    /// Returns `true` if the key was under trial before.
    pub fn exit(&self, key: &str) -> bool {
        self.under_trial.remove(key).is_some()
    }

    pub fn is_under_trial(&self, key: &str) -> bool {
        self.under_trial.get(key).map(|v| *v).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.under_trial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.under_trial.is_empty()
    }
}

/// Circuit breaker parameters. `trial_interval_seconds <= 0` disables it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreaker {
    pub permit_limit: i64,
    pub trial_interval_seconds: i64,
    pub should_throw_on_failures: bool,
}

impl CircuitBreaker {
    pub fn new(permit_limit: i64, trial_interval_seconds: i64) -> Self {
        Self {
            permit_limit,
            trial_interval_seconds,
            should_throw_on_failures: false,
        }
    }

    pub fn with_throw_on_failures(mut self, should_throw: bool) -> Self {
        self.should_throw_on_failures = should_throw;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.trial_interval_seconds > 0
    }

    pub fn retry_after_seconds(&self) -> u64 {
        self.trial_interval_seconds.max(0) as u64
    }

    /// Any error is a failure; otherwise only 2xx counts as success.
    pub fn is_failed(status: Option<u16>, errored: bool) -> bool {
        if errored {
            return true;
        }
        match status {
            Some(code) => !(200..300).contains(&code),
            None => false,
        }
    }

    fn trial_key(key: &str) -> String {
        format!("{}-trial", key)
    }

    fn failures_key(key: &str) -> String {
        format!("{}-failures", key)
    }

    pub(crate) async fn is_exceeded(
        &self,
        key: &str,
        cost: i64,
        ctx: &MethodContext,
    ) -> Result<i64> {
        if !self.is_enabled() || !ctx.trials.is_under_trial(key) {
            return Ok(self.permit_limit);
        }

        let window_end = window_end_millis(ctx.now_millis(), self.trial_interval_seconds);
        let trials = ctx
            .breaker_store
            .increment_and_get(
                &Self::trial_key(key),
                cost,
                at_millis(window_end),
                self.permit_limit,
            )
            .await?;
        let remaining = self.permit_limit - trials;

        trace!(key = %key, trials = trials, remaining = remaining, "Circuit under trial");
        Ok(remaining)
    }

    pub(crate) async fn is_still_exceeded(&self, key: &str, ctx: &MethodContext) -> Result<bool> {
        if !self.is_enabled() || !ctx.trials.is_under_trial(key) {
            return Ok(false);
        }
        Ok(ctx.breaker_store.get(&Self::trial_key(key)).await? >= self.permit_limit)
    }

    /// Feed the outcome of a completed call back into the breaker.
    pub async fn record_outcome(&self, key: &str, failed: bool, ctx: &MethodContext) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        if !failed {
            if ctx.trials.exit(key) {
                ctx.breaker_store.remove(&Self::trial_key(key));
                ctx.breaker_store.remove(&Self::failures_key(key));
                info!(key = %key, "Circuit closed");
            }
            return Ok(());
        }

        if ctx.trials.is_under_trial(key) {
            debug!(key = %key, "Trial call failed, circuit stays under trial");
            return Ok(());
        }

        let window_end = window_end_millis(ctx.now_millis(), self.trial_interval_seconds);
        let failures = ctx
            .breaker_store
            .increment_and_get(
                &Self::failures_key(key),
                1,
                at_millis(window_end),
                self.permit_limit,
            )
            .await?;
        debug!(key = %key, failures = failures, limit = self.permit_limit, "Recorded failure");

        if failures >= self.permit_limit && ctx.trials.enter(key) {
            ctx.breaker_store.remove(&Self::failures_key(key));
            info!(key = %key, failures = failures, "Circuit tripped, entering trial");
        }
        Ok(())
    }
}
