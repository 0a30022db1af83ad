//! Rate limit methods: a closed set of algorithms sharing one verb set.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::circuit_breaker::{CircuitBreaker, TrialRegistry};
use super::fixed_window::FixedWindow;
use super::semaphore::Semaphore;
use super::sliding_window::SlidingWindow;
use crate::clock::{system_clock, SharedClock};
use crate::error::{Result, ThrottleError};
use crate::store::{CounterStore, MemoryCounterStore};

/// Algorithm identity, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    FixedWindow,
    SlidingWindow,
    Semaphore,
    CircuitBreaker,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodKind::FixedWindow => "FixedWindow",
            MethodKind::SlidingWindow => "SlidingWindow",
            MethodKind::Semaphore => "Semaphore",
            MethodKind::CircuitBreaker => "CircuitBreaker",
        };
        write!(f, "{}", name)
    }
}

/// Flat parameter set for building any method from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSettings {
    pub algorithm: MethodKind,
    pub permit_limit: i64,
    #[serde(default)]
    pub interval_seconds: i64,
    #[serde(default = "default_buckets")]
    pub num_of_buckets: i64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub release_after_seconds: i64,
    #[serde(default)]
    pub trial_interval_seconds: i64,
    #[serde(default)]
    pub should_throw_on_failures: bool,
}

fn default_buckets() -> i64 {
    1
}

fn default_timeout() -> i64 {
    100
}

/// One rate limiting algorithm with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MethodSettings", into = "MethodSettings")]
pub enum RateLimitMethod {
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindow),
    Semaphore(Semaphore),
    CircuitBreaker(CircuitBreaker),
}

impl TryFrom<MethodSettings> for RateLimitMethod {
    type Error = ThrottleError;

    fn try_from(settings: MethodSettings) -> Result<Self> {
        Self::from_settings(&settings)
    }
}

impl From<RateLimitMethod> for MethodSettings {
    fn from(method: RateLimitMethod) -> Self {
        let mut settings = MethodSettings {
            algorithm: method.kind(),
            permit_limit: method.permit_limit(),
            interval_seconds: 0,
            num_of_buckets: default_buckets(),
            timeout_seconds: default_timeout(),
            release_after_seconds: 0,
            trial_interval_seconds: 0,
            should_throw_on_failures: method.should_throw_on_failures(),
        };
        match method {
            RateLimitMethod::FixedWindow(m) => settings.interval_seconds = m.interval_seconds,
            RateLimitMethod::SlidingWindow(m) => {
                settings.interval_seconds = m.interval_seconds;
                settings.num_of_buckets = m.num_of_buckets;
            }
            RateLimitMethod::Semaphore(m) => {
                settings.timeout_seconds = m.timeout_seconds;
                settings.release_after_seconds = m.release_after_seconds;
            }
            RateLimitMethod::CircuitBreaker(m) => {
                settings.trial_interval_seconds = m.trial_interval_seconds;
            }
        }
        settings
    }
}

impl RateLimitMethod {
    /// Build and validate a method from flat settings.
    pub fn from_settings(s: &MethodSettings) -> Result<Self> {
        let method = match s.algorithm {
            MethodKind::FixedWindow => RateLimitMethod::FixedWindow(FixedWindow {
                permit_limit: s.permit_limit,
                interval_seconds: s.interval_seconds,
                should_throw_on_failures: s.should_throw_on_failures,
            }),
            MethodKind::SlidingWindow => RateLimitMethod::SlidingWindow(SlidingWindow {
                permit_limit: s.permit_limit,
                interval_seconds: s.interval_seconds,
                num_of_buckets: s.num_of_buckets,
                should_throw_on_failures: s.should_throw_on_failures,
            }),
            MethodKind::Semaphore => RateLimitMethod::Semaphore(Semaphore {
                permit_limit: s.permit_limit,
                timeout_seconds: s.timeout_seconds,
                release_after_seconds: s.release_after_seconds,
                should_throw_on_failures: s.should_throw_on_failures,
            }),
            MethodKind::CircuitBreaker => RateLimitMethod::CircuitBreaker(CircuitBreaker {
                permit_limit: s.permit_limit,
                trial_interval_seconds: s.trial_interval_seconds,
                should_throw_on_failures: s.should_throw_on_failures,
            }),
        };
        method.validate()?;
        Ok(method)
    }

    pub fn kind(&self) -> MethodKind {
        match self {
            RateLimitMethod::FixedWindow(_) => MethodKind::FixedWindow,
            RateLimitMethod::SlidingWindow(_) => MethodKind::SlidingWindow,
            RateLimitMethod::Semaphore(_) => MethodKind::Semaphore,
            RateLimitMethod::CircuitBreaker(_) => MethodKind::CircuitBreaker,
        }
    }

    pub fn permit_limit(&self) -> i64 {
        match self {
            RateLimitMethod::FixedWindow(m) => m.permit_limit,
            RateLimitMethod::SlidingWindow(m) => m.permit_limit,
            RateLimitMethod::Semaphore(m) => m.permit_limit,
            RateLimitMethod::CircuitBreaker(m) => m.permit_limit,
        }
    }

    pub fn should_throw_on_failures(&self) -> bool {
        match self {
            RateLimitMethod::FixedWindow(m) => m.should_throw_on_failures,
            RateLimitMethod::SlidingWindow(m) => m.should_throw_on_failures,
            RateLimitMethod::Semaphore(m) => m.should_throw_on_failures,
            RateLimitMethod::CircuitBreaker(m) => m.should_throw_on_failures,
        }
    }

    /// Algorithm identity plus parameters. Part of every counter key, so a
    /// changed limit never reuses counters written under the old one.
    pub fn cache_key_fragment(&self) -> String {
        match self {
            RateLimitMethod::FixedWindow(m) => {
                format!("{}({},{})", self.kind(), m.permit_limit, m.interval_seconds)
            }
            RateLimitMethod::SlidingWindow(m) => format!(
                "{}({},{},{})",
                self.kind(),
                m.permit_limit,
                m.interval_seconds,
                m.num_of_buckets
            ),
            RateLimitMethod::Semaphore(m) => format!(
                "{}({},{},{})",
                self.kind(),
                m.permit_limit,
                m.timeout_seconds,
                m.release_after_seconds
            ),
            RateLimitMethod::CircuitBreaker(m) => {
                format!("{}({},{})", self.kind(), m.permit_limit, m.trial_interval_seconds)
            }
        }
    }

    /// Suggested client back-off when this method rejects a request.
    pub fn retry_after_seconds(&self) -> u64 {
        match self {
            RateLimitMethod::FixedWindow(m) => m.retry_after_seconds(),
            RateLimitMethod::SlidingWindow(m) => m.retry_after_seconds(),
            RateLimitMethod::Semaphore(m) => m.retry_after_seconds(),
            RateLimitMethod::CircuitBreaker(m) => m.retry_after_seconds(),
        }
    }

    /// Whether a successful check holds a slot that must be given back.
    pub fn requires_release(&self) -> bool {
        matches!(self, RateLimitMethod::Semaphore(_))
    }

    pub fn validate(&self) -> Result<()> {
        if self.permit_limit() < 0 {
            return Err(ThrottleError::InvalidMethod(format!(
                "{}: permit_limit must not be negative",
                self.kind()
            )));
        }
        match self {
            RateLimitMethod::FixedWindow(m) => m.validate(),
            RateLimitMethod::SlidingWindow(m) => m.validate(),
            RateLimitMethod::Semaphore(m) => m.validate(),
            RateLimitMethod::CircuitBreaker(_) => Ok(()),
        }
    }

    /// Count this request against the limit. Returns the remaining quota;
    /// a negative value means the limit is exceeded.
    pub async fn is_exceeded(
        &self,
        key: &str,
        cost: i64,
        store: &dyn CounterStore,
        ctx: &MethodContext,
    ) -> Result<i64> {
        match self {
            RateLimitMethod::FixedWindow(m) => m.is_exceeded(key, cost, store, ctx).await,
            RateLimitMethod::SlidingWindow(m) => m.is_exceeded(key, cost, store, ctx).await,
            RateLimitMethod::Semaphore(m) => m.is_exceeded(key, cost, store, ctx).await,
            RateLimitMethod::CircuitBreaker(m) => m.is_exceeded(key, cost, ctx).await,
        }
    }

    /// Read-only check: would the next request still be rejected?
    pub async fn is_still_exceeded(
        &self,
        key: &str,
        store: &dyn CounterStore,
        ctx: &MethodContext,
    ) -> Result<bool> {
        match self {
            RateLimitMethod::FixedWindow(m) => m.is_still_exceeded(key, store, ctx).await,
            RateLimitMethod::SlidingWindow(m) => m.is_still_exceeded(key, store, ctx).await,
            RateLimitMethod::Semaphore(m) => m.is_still_exceeded(key, store).await,
            RateLimitMethod::CircuitBreaker(m) => m.is_still_exceeded(key, ctx).await,
        }
    }

    /// Give back what a successful check took. No-op except for semaphores.
    pub async fn decrement(&self, key: &str, cost: i64, store: &dyn CounterStore) -> Result<()> {
        match self {
            RateLimitMethod::Semaphore(m) => m.decrement(key, cost, store).await,
            _ => Ok(()),
        }
    }

    pub fn as_circuit_breaker(&self) -> Option<&CircuitBreaker> {
        match self {
            RateLimitMethod::CircuitBreaker(m) => Some(m),
            _ => None,
        }
    }
}

impl From<FixedWindow> for RateLimitMethod {
    fn from(m: FixedWindow) -> Self {
        RateLimitMethod::FixedWindow(m)
    }
}

impl From<SlidingWindow> for RateLimitMethod {
    fn from(m: SlidingWindow) -> Self {
        RateLimitMethod::SlidingWindow(m)
    }
}

impl From<Semaphore> for RateLimitMethod {
    fn from(m: Semaphore) -> Self {
        RateLimitMethod::Semaphore(m)
    }
}

impl From<CircuitBreaker> for RateLimitMethod {
    fn from(m: CircuitBreaker) -> Self {
        RateLimitMethod::CircuitBreaker(m)
    }
}

/// Every this many marks, stale markers are swept.
const SWEEP_EVERY: u64 = 1024;

/// Process-local "already exceeded" markers.
///
/// Once a window is known to be exceeded, later checks in the same window can
/// answer without a store round trip. Stale markers are dropped when read, and
/// periodically on write for keys that are never read again.
#[derive(Debug, Default)]
pub struct ExceededMarkers {
    until: DashMap<String, i64>,
    marks: AtomicU64,
}

impl ExceededMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, key: &str, until_millis: i64, now_millis: i64) {
        self.until.insert(key.to_string(), until_millis);
        if self.marks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let before = self.until.len();
            self.until.retain(|_, until| *until > now_millis);
            let removed = before.saturating_sub(self.until.len());
            trace!(removed = removed, "Swept stale exceeded markers");
        }
    }

    pub fn is_marked(&self, key: &str, now_millis: i64) -> bool {
        let live = match self.until.get(key) {
            Some(until) => *until > now_millis,
            None => return false,
        };
        if !live {
            self.until.remove_if(key, |_, until| *until <= now_millis);
        }
        live
    }

    pub fn len(&self) -> usize {
        self.until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.until.is_empty()
    }
}

/// Process-local state shared by every method evaluation.
#[derive(Clone)]
pub struct MethodContext {
    pub clock: SharedClock,
    pub markers: Arc<ExceededMarkers>,
    pub trials: Arc<TrialRegistry>,
    /// Private store for circuit breaker failure and trial counts
    pub breaker_store: Arc<MemoryCounterStore>,
}

impl MethodContext {
    pub fn new(clock: SharedClock, trials: Arc<TrialRegistry>) -> Self {
        Self {
            breaker_store: Arc::new(MemoryCounterStore::with_clock(clock.clone())),
            clock,
            markers: Arc::new(ExceededMarkers::new()),
            trials,
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}

impl Default for MethodContext {
    fn default() -> Self {
        Self::new(system_clock(), TrialRegistry::global())
    }
}

/// End of the wall-clock aligned window of `interval_seconds` containing
/// `now_millis`, in epoch milliseconds.
pub(crate) fn window_end_millis(now_millis: i64, interval_seconds: i64) -> i64 {
    let interval = interval_seconds.max(1);
    let window = now_millis.div_euclid(1000).div_euclid(interval);
    (window + 1) * interval * 1000
}

pub(crate) fn at_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
