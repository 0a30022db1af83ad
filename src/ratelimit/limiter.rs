//! The throttling orchestrator.
//!
//! A [`Throttler`] owns the current configuration snapshot and evaluates every
//! matching rule for a request against a shared counter store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::check::{LimitCheckResult, Verdict};
use super::circuit_breaker::{CircuitBreaker, TrialRegistry};
use super::descriptor::Direction;
use super::method::{MethodContext, RateLimitMethod};
use super::request::RequestProxy;
use super::rules::{ConfigSnapshot, Rule};
use super::source::{ConfigSource, StaticConfigSource};
use crate::clock::{system_clock, SharedClock};
use crate::error::{Result, ThrottleError};
use crate::store::{spawn_periodic, CounterStore, MemoryCounterStore};

/// Default pause between two capacity checks while a request is delayed.
pub const DEFAULT_DELAY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One slot taken by a successful check that must be given back.
struct Lease {
    method: RateLimitMethod,
    key: String,
    cost: i64,
}

/// Holds the slots taken by an evaluation.
///
/// Rules register a slot the moment they take it, while sibling rules may
/// still be running. [`release`](ReleaseGuard::release) gives them back
/// inline. A guard dropped without being released (cancelled future, panic)
/// hands them to a spawned task, so a slot is never leaked.
pub struct ReleaseGuard {
    store: Arc<dyn CounterStore>,
    leases: Mutex<Vec<Lease>>,
}

impl ReleaseGuard {
    fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            leases: Mutex::new(Vec::new()),
        }
    }

    fn hold(&self, method: RateLimitMethod, key: String, cost: i64) {
        self.leases.lock().push(Lease { method, key, cost });
    }

    pub fn len(&self) -> usize {
        self.leases.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn release(self) {
        let leases = std::mem::take(&mut *self.leases.lock());
        release_leases(self.store.clone(), leases).await;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let leases = std::mem::take(self.leases.get_mut());
        if leases.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_leases(self.store.clone(), leases));
            }
            Err(_) => warn!(
                slots = leases.len(),
                "No runtime to release slots, they will expire on timeout"
            ),
        }
    }
}

async fn release_leases(store: Arc<dyn CounterStore>, leases: Vec<Lease>) {
    for lease in leases {
        match &lease.method {
            RateLimitMethod::Semaphore(semaphore) if semaphore.release_after_seconds > 0 => {
                semaphore.spawn_deferred_release(lease.key, lease.cost, store.clone());
            }
            method => {
                if let Err(e) = method.decrement(&lease.key, lease.cost, store.as_ref()).await {
                    warn!(key = %lease.key, error = %e, "Failed to release slot");
                }
            }
        }
    }
}

/// Everything a caller needs after checking a request.
pub struct Evaluation {
    pub verdict: Verdict,
    /// One result per evaluated rule, in rule order
    pub results: Vec<LimitCheckResult>,
    guard: ReleaseGuard,
}

impl Evaluation {
    pub fn exceeded(&self) -> Option<&LimitCheckResult> {
        match &self.verdict {
            Verdict::Exceeded(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.verdict.is_exceeded()
    }

    /// Number of slots this evaluation still holds.
    pub fn held(&self) -> usize {
        self.guard.len()
    }

    /// Give back every slot taken by this evaluation.
    pub async fn release(self) {
        self.guard.release().await
    }
}

impl fmt::Debug for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluation")
            .field("verdict", &self.verdict)
            .field("results", &self.results)
            .field("held", &self.guard.len())
            .finish()
    }
}

/// Evaluates requests against the current configuration.
pub struct Throttler {
    direction: Direction,
    store: Arc<dyn CounterStore>,
    source: Arc<dyn ConfigSource>,
    snapshot: ArcSwap<ConfigSnapshot>,
    ctx: MethodContext,
    delay_poll_interval: Duration,
}

/// Builder for [`Throttler`].
pub struct ThrottlerBuilder {
    direction: Direction,
    store: Option<Arc<dyn CounterStore>>,
    source: Option<Arc<dyn ConfigSource>>,
    clock: SharedClock,
    trials: Option<Arc<TrialRegistry>>,
    delay_poll_interval: Duration,
}

impl ThrottlerBuilder {
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn snapshot(self, snapshot: ConfigSnapshot) -> Self {
        self.source(Arc::new(StaticConfigSource::new(snapshot)))
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use a private trial registry instead of the process-wide one.
    pub fn trials(mut self, trials: Arc<TrialRegistry>) -> Self {
        self.trials = Some(trials);
        self
    }

    pub fn delay_poll_interval(mut self, interval: Duration) -> Self {
        self.delay_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Build the throttler and load the first snapshot.
    ///
    /// A failing source is logged and leaves the throttler without rules.
    pub async fn build(self) -> Throttler {
        let clock = self.clock;
        let store: Arc<dyn CounterStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryCounterStore::with_clock(clock.clone())),
        };
        let source: Arc<dyn ConfigSource> = match self.source {
            Some(source) => source,
            None => Arc::new(StaticConfigSource::default()),
        };
        let trials = self.trials.unwrap_or_else(TrialRegistry::global);

        let throttler = Throttler {
            direction: self.direction,
            store,
            source,
            snapshot: ArcSwap::from_pointee(ConfigSnapshot::default()),
            ctx: MethodContext::new(clock, trials),
            delay_poll_interval: self.delay_poll_interval,
        };
        throttler.reload().await;
        throttler
    }
}

impl Throttler {
    pub fn builder(direction: Direction) -> ThrottlerBuilder {
        ThrottlerBuilder {
            direction,
            store: None,
            source: None,
            clock: system_clock(),
            trials: None,
            delay_poll_interval: DEFAULT_DELAY_POLL_INTERVAL,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn context(&self) -> &MethodContext {
        &self.ctx
    }

    /// The snapshot currently in effect.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    /// Fetch the configuration and swap it in. On failure the previous
    /// snapshot stays active. Returns whether a new snapshot was installed.
    pub async fn reload(&self) -> bool {
        match self.source.fetch().await {
            Ok(snapshot) => {
                info!(
                    direction = %self.direction,
                    unique_name = %snapshot.unique_name,
                    rules = snapshot.rules.len(),
                    "Throttling configuration loaded"
                );
                self.snapshot.store(Arc::new(snapshot));
                true
            }
            Err(e) => {
                error!(
                    direction = %self.direction,
                    error = %e,
                    "Failed to load throttling configuration, keeping current rules"
                );
                false
            }
        }
    }

    /// Reload the configuration every `interval` until `shutdown` fires.
    pub fn spawn_reload(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Starting configuration reload");
        spawn_periodic(interval, shutdown, move || {
            let throttler = self.clone();
            async move {
                throttler.reload().await;
            }
        })
    }

    /// Evaluate every matching rule for `request`.
    ///
    /// Counters of all matching rules are updated even when one of them is
    /// already exceeded. The returned evaluation holds any semaphore slots
    /// taken; callers release it once the protected work is done.
    pub async fn check(
        &self,
        request: &RequestProxy,
        cancel: &CancellationToken,
    ) -> Result<Evaluation> {
        let snapshot = self.snapshot.load_full();
        let guard = ReleaseGuard::new(self.store.clone());

        if snapshot.is_whitelisted(request) {
            trace!(uri = %request.uri(), "Request whitelisted");
            return Ok(Evaluation {
                verdict: Verdict::Whitelisted,
                results: Vec::new(),
                guard,
            });
        }

        let rules = snapshot.matching_rules(request);
        let outcomes = join_all(
            rules
                .iter()
                .map(|rule| self.check_rule(rule, request, &snapshot.unique_name, &guard, cancel)),
        )
        .await;

        let mut results = Vec::with_capacity(rules.len());
        let mut failure: Option<ThrottleError> = None;
        for (rule, outcome) in rules.iter().zip(outcomes) {
            match outcome {
                Ok(result) => results.push(result),
                Err(ThrottleError::Cancelled) => {
                    failure = failure.or(Some(ThrottleError::Cancelled));
                }
                Err(e) if rule.method.should_throw_on_failures() => {
                    error!(rule = %rule.display_name(), error = %e, "Rule evaluation failed");
                    failure = failure.or(Some(e));
                }
                Err(e) => {
                    error!(
                        rule = %rule.display_name(),
                        error = %e,
                        "Rule evaluation failed, treating as not exceeded"
                    );
                }
            }
        }

        if let Some(e) = failure {
            guard.release().await;
            return Err(e);
        }

        let verdict = Verdict::from_results(&results);
        if let Verdict::Exceeded(worst) = &verdict {
            debug!(
                uri = %request.uri(),
                counter = %worst.counter_id,
                retry_after = worst.retry_after_seconds,
                "Request throttled"
            );
        }

        Ok(Evaluation {
            verdict,
            results,
            guard,
        })
    }

    async fn check_rule(
        &self,
        rule: &Arc<Rule>,
        request: &RequestProxy,
        unique_name: &str,
        guard: &ReleaseGuard,
        cancel: &CancellationToken,
    ) -> Result<LimitCheckResult> {
        let key = rule.cache_key(request, unique_name, self.direction);
        let cost = rule.cost(request);

        let mut remaining = rule
            .method
            .is_exceeded(&key, cost, self.store.as_ref(), &self.ctx)
            .await?;
        if remaining < 0 && rule.max_delay_seconds > 0 {
            remaining = self.wait_for_capacity(rule, &key, cost, remaining, cancel).await?;
        }
        if remaining >= 0 && rule.method.requires_release() {
            guard.hold(rule.method.clone(), key.clone(), cost);
        }

        trace!(rule = %rule.display_name(), key = %key, remaining = remaining, "Rule checked");
        Ok(LimitCheckResult::new(rule.clone(), remaining, key))
    }

    /// Poll until the rule has capacity again or its maximum delay is used up.
    async fn wait_for_capacity(
        &self,
        rule: &Rule,
        key: &str,
        cost: i64,
        mut remaining: i64,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let deadline = Instant::now() + Duration::from_secs(rule.max_delay_seconds);
        let step = self
            .delay_poll_interval
            .min(Duration::from_secs(rule.method.retry_after_seconds().max(1)));

        debug!(key = %key, max_delay = rule.max_delay_seconds, "Limit exceeded, delaying request");
        while remaining < 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ThrottleError::Cancelled),
                _ = tokio::time::sleep(step.min(deadline - now)) => {}
            }

            let store = self.store.as_ref();
            if rule.method.is_still_exceeded(key, store, &self.ctx).await? {
                continue;
            }
            remaining = rule.method.is_exceeded(key, cost, store, &self.ctx).await?;
        }
        Ok(remaining)
    }

    /// Feed the outcome of the protected call to every matching circuit
    /// breaker. Errors are logged, never returned.
    pub async fn record_outcome(&self, request: &RequestProxy, status: Option<u16>, errored: bool) {
        let snapshot = self.snapshot.load_full();
        if snapshot.is_whitelisted(request) {
            return;
        }

        let failed = CircuitBreaker::is_failed(status, errored);
        for rule in snapshot.matching_rules(request) {
            let Some(breaker) = rule.method.as_circuit_breaker() else {
                continue;
            };
            let key = rule.cache_key(request, &snapshot.unique_name, self.direction);
            if let Err(e) = breaker.record_outcome(&key, failed, &self.ctx).await {
                warn!(rule = %rule.display_name(), error = %e, "Failed to record call outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::fixed_window::FixedWindow;
    use crate::ratelimit::rules::{FilterConfig, RequestFilter};
    use crate::ratelimit::semaphore::Semaphore;
    use crate::ratelimit::source::FnConfigSource;

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<i64> {
            Err(ThrottleError::Store("unreachable".to_string()))
        }

        async fn increment_and_get(
            &self,
            _: &str,
            _: i64,
            _: DateTime<Utc>,
            _: i64,
        ) -> Result<i64> {
            Err(ThrottleError::Store("unreachable".to_string()))
        }

        async fn decrement(&self, _key: &str, _cost: i64) -> Result<()> {
            Err(ThrottleError::Store("unreachable".to_string()))
        }
    }

    fn request(uri: &str) -> RequestProxy {
        RequestProxy::parse("GET", uri).unwrap()
    }

    async fn throttler(snapshot: ConfigSnapshot) -> (Throttler, Arc<MemoryCounterStore>) {
        let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let throttler = Throttler::builder(Direction::Ingress)
            .store(store.clone())
            .clock(clock)
            .trials(Arc::new(TrialRegistry::new()))
            .delay_poll_interval(Duration::from_millis(20))
            .snapshot(snapshot)
            .build()
            .await;
        (throttler, store)
    }

    fn rule(pattern: &str, method: impl Into<RateLimitMethod>) -> Rule {
        Rule::new(FilterConfig::uri(pattern).compile().unwrap(), method)
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_rules() {
        let snapshot = ConfigSnapshot::new("svc")
            .with_rule(rule("", FixedWindow::new(0, 10)))
            .with_whitelisted(FilterConfig::uri("^/health").compile().unwrap());
        let (throttler, store) = throttler(snapshot).await;
        let cancel = CancellationToken::new();

        let evaluation = assert_ok!(throttler.check(&request("/health"), &cancel).await);
        assert!(matches!(evaluation.verdict, Verdict::Whitelisted));
        assert!(store.is_empty());

        let evaluation = assert_ok!(throttler.check(&request("/orders"), &cancel).await);
        assert!(evaluation.is_exceeded());
    }

    #[tokio::test]
    async fn test_every_matching_rule_is_counted() {
        let snapshot = ConfigSnapshot::new("svc")
            .with_rule(rule("/a", FixedWindow::new(1, 10)))
            .with_rule(rule("", FixedWindow::new(5, 10)))
            .with_rule(rule("/b", FixedWindow::new(5, 10)));
        let (throttler, store) = throttler(snapshot).await;
        let cancel = CancellationToken::new();

        let first = throttler.check(&request("/a"), &cancel).await.unwrap();
        assert!(!first.is_exceeded());
        let second = throttler.check(&request("/a"), &cancel).await.unwrap();
        assert!(second.is_exceeded());
        assert_eq!(second.results.len(), 2);

        for result in &second.results {
            assert_eq!(store.get(&result.counter_id).await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_longest_retry_after_wins() {
        let snapshot = ConfigSnapshot::new("svc")
            .with_rule(rule("", FixedWindow::new(0, 5)))
            .with_rule(rule("", FixedWindow::new(0, 10)));
        let (throttler, _store) = throttler(snapshot).await;

        let evaluation = throttler.check(&request("/"), &CancellationToken::new()).await.unwrap();
        assert_eq!(evaluation.exceeded().unwrap().retry_after_seconds, 10);
        assert_eq!(evaluation.exceeded().unwrap().status_code, 429);
    }

    #[tokio::test]
    async fn test_fail_open_on_config_error() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let source = FnConfigSource::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ThrottleError::Config("control plane down".to_string())) }
        });

        let throttler = Throttler::builder(Direction::Ingress)
            .source(Arc::new(source))
            .build()
            .await;
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(throttler.snapshot().rules.is_empty());

        let evaluation = throttler.check(&request("/"), &CancellationToken::new()).await.unwrap();
        assert!(matches!(evaluation.verdict, Verdict::Allowed));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let source = FnConfigSource::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Ok(ConfigSnapshot::new("svc").with_rule(rule("", FixedWindow::new(1, 1))))
                } else {
                    Err(ThrottleError::Config("gone".to_string()))
                }
            }
        });

        let throttler = Throttler::builder(Direction::Egress)
            .source(Arc::new(source))
            .trials(Arc::new(TrialRegistry::new()))
            .build()
            .await;
        assert!(!throttler.reload().await);
        assert_eq!(throttler.snapshot().rules.len(), 1);
        assert_eq!(throttler.snapshot().unique_name, "svc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reload_swaps_in_new_rules() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let source = FnConfigSource::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match attempt {
                    0 => {
                        Ok(ConfigSnapshot::new("v1").with_rule(rule("", FixedWindow::new(1, 1))))
                    }
                    1 => Ok(ConfigSnapshot::new("v2")
                        .with_rule(rule("/a", FixedWindow::new(1, 1)))
                        .with_rule(rule("/b", FixedWindow::new(1, 1)))),
                    _ => Err(ThrottleError::Config("control plane down".to_string())),
                }
            }
        });

        let throttler = Arc::new(
            Throttler::builder(Direction::Ingress)
                .source(Arc::new(source))
                .trials(Arc::new(TrialRegistry::new()))
                .build()
                .await,
        );
        assert_eq!(throttler.snapshot().unique_name, "v1");

        let shutdown = CancellationToken::new();
        let handle = throttler.clone().spawn_reload(Duration::from_secs(10), shutdown.clone());

        // Nothing happens before the first interval elapses
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(throttler.snapshot().unique_name, "v1");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(throttler.snapshot().unique_name, "v2");
        assert_eq!(throttler.snapshot().rules.len(), 2);

        // A failing fetch leaves the installed rules alone
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        assert_eq!(throttler.snapshot().unique_name, "v2");
        assert_eq!(throttler.snapshot().rules.len(), 2);

        shutdown.cancel();
        assert_ok!(handle.await);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rule_errors_follow_policy() {
        let lenient = ConfigSnapshot::new("svc").with_rule(rule("", FixedWindow::new(1, 10)));
        let throttler = Throttler::builder(Direction::Ingress)
            .store(Arc::new(FailingStore))
            .snapshot(lenient)
            .build()
            .await;
        let evaluation =
            assert_ok!(throttler.check(&request("/"), &CancellationToken::new()).await);
        assert!(matches!(evaluation.verdict, Verdict::Allowed));
        assert!(evaluation.results.is_empty());

        let strict = ConfigSnapshot::new("svc")
            .with_rule(rule("", FixedWindow::new(1, 10).with_throw_on_failures(true)));
        let throttler = Throttler::builder(Direction::Ingress)
            .store(Arc::new(FailingStore))
            .snapshot(strict)
            .build()
            .await;
        let err = assert_err!(throttler.check(&request("/"), &CancellationToken::new()).await);
        assert!(matches!(err, ThrottleError::Store(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_request_gets_released_slot() {
        let snapshot = ConfigSnapshot::new("svc")
            .with_rule(rule("", Semaphore::new(1, 30)).with_max_delay(5));
        let throttler = Arc::new(
            Throttler::builder(Direction::Ingress)
                .trials(Arc::new(TrialRegistry::new()))
                .delay_poll_interval(Duration::from_millis(50))
                .snapshot(snapshot)
                .build()
                .await,
        );
        let cancel = CancellationToken::new();

        let holder = throttler.check(&request("/"), &cancel).await.unwrap();
        assert_eq!(holder.held(), 1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            holder.release().await;
        });

        let started = Instant::now();
        let waiter = throttler.check(&request("/"), &cancel).await.unwrap();
        assert!(!waiter.is_exceeded());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
        waiter.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_never_exceeds_max() {
        let snapshot = ConfigSnapshot::new("svc")
            .with_rule(rule("", Semaphore::new(1, 30)).with_max_delay(1));
        let throttler = Throttler::builder(Direction::Ingress)
            .trials(Arc::new(TrialRegistry::new()))
            .delay_poll_interval(Duration::from_millis(50))
            .snapshot(snapshot)
            .build()
            .await;
        let cancel = CancellationToken::new();

        let _holder = throttler.check(&request("/"), &cancel).await.unwrap();
        let started = Instant::now();
        let waiter = throttler.check(&request("/"), &cancel).await.unwrap();
        assert!(waiter.is_exceeded());
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() <= Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_delay_releases_other_slots() {
        let snapshot = ConfigSnapshot::new("svc")
            .with_rule(rule("", Semaphore::new(5, 30)))
            .with_rule(rule("", FixedWindow::new(0, 60)).with_max_delay(30));
        let (throttler, store) = throttler(snapshot).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = assert_err!(throttler.check(&request("/"), &cancel).await);
        assert!(matches!(err, ThrottleError::Cancelled));

        let semaphore = throttler.snapshot().rules[0].clone();
        let key = semaphore.cache_key(&request("/"), "svc", Direction::Ingress);
        assert_eq!(store.get(&key).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_check_releases_taken_slots() {
        let snapshot = ConfigSnapshot::new("svc")
            .with_rule(rule("", Semaphore::new(5, 30)))
            .with_rule(rule("", FixedWindow::new(0, 60)).with_max_delay(30));
        let (throttler, store) = throttler(snapshot).await;
        let cancel = CancellationToken::new();

        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            throttler.check(&request("/"), &cancel),
        )
        .await;
        assert!(outcome.is_err());

        let semaphore = throttler.snapshot().rules[0].clone();
        let key = semaphore.cache_key(&request("/"), "svc", Direction::Ingress);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.get(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_evaluation_releases_slot() {
        let snapshot = ConfigSnapshot::new("svc").with_rule(rule("", Semaphore::new(1, 30)));
        let (throttler, store) = throttler(snapshot).await;

        let evaluation = throttler.check(&request("/"), &CancellationToken::new()).await.unwrap();
        let key = evaluation.results[0].counter_id.clone();
        assert_eq!(store.get(&key).await.unwrap(), 1);

        drop(evaluation);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.get(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_outcomes() {
        let snapshot = ConfigSnapshot::new("svc")
            .with_rule(Rule::new(RequestFilter::any(), CircuitBreaker::new(2, 10)));
        let (throttler, _store) = throttler(snapshot).await;
        let cancel = CancellationToken::new();
        let req = request("/downstream");

        throttler.record_outcome(&req, Some(500), false).await;
        throttler.record_outcome(&req, None, true).await;

        assert!(!throttler.check(&req, &cancel).await.unwrap().is_exceeded());
        assert!(!throttler.check(&req, &cancel).await.unwrap().is_exceeded());
        let tripped = throttler.check(&req, &cancel).await.unwrap();
        assert_eq!(tripped.exceeded().unwrap().status_code, 503);
        assert_eq!(tripped.exceeded().unwrap().retry_after_seconds, 10);

        throttler.record_outcome(&req, Some(200), false).await;
        assert!(!throttler.check(&req, &cancel).await.unwrap().is_exceeded());
    }
}
