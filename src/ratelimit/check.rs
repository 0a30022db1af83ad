//! Outcomes of rule evaluation.

use std::fmt;
use std::sync::Arc;

use super::method::MethodKind;
use super::rules::Rule;
pub use crate::error::TooManyRequests;

const TOO_MANY_REQUESTS: u16 = 429;
const SERVICE_UNAVAILABLE: u16 = 503;

/// Result of evaluating one rule against one request.
#[derive(Clone)]
pub struct LimitCheckResult {
    /// Remaining quota; negative once the limit is exceeded
    pub requests_remaining: i64,
    pub retry_after_seconds: u64,
    /// Storage key of the counter that produced this result
    pub counter_id: String,
    /// Status a throttled response should carry
    pub status_code: u16,
    /// `None` for results propagated from an egress call
    pub rule: Option<Arc<Rule>>,
}

impl LimitCheckResult {
    pub fn new(rule: Arc<Rule>, requests_remaining: i64, counter_id: String) -> Self {
        let status_code = match rule.method.kind() {
            MethodKind::CircuitBreaker => SERVICE_UNAVAILABLE,
            _ => TOO_MANY_REQUESTS,
        };
        Self {
            requests_remaining,
            retry_after_seconds: rule.method.retry_after_seconds(),
            counter_id,
            status_code,
            rule: Some(rule),
        }
    }

    /// A result that did not come from a local rule.
    pub fn propagated(
        requests_remaining: i64,
        retry_after_seconds: u64,
        counter_id: String,
        status_code: u16,
    ) -> Self {
        Self {
            requests_remaining,
            retry_after_seconds,
            counter_id,
            status_code,
            rule: None,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.requests_remaining < 0
    }

    /// The signal carried from an egress gate up to the ingress gate.
    pub fn to_signal(&self) -> TooManyRequests {
        TooManyRequests {
            retry_after_seconds: self.retry_after_seconds,
            counter_id: self.counter_id.clone(),
            status_code: self.status_code,
        }
    }
}

impl From<&TooManyRequests> for LimitCheckResult {
    fn from(signal: &TooManyRequests) -> Self {
        Self::propagated(
            -1,
            signal.retry_after_seconds,
            signal.counter_id.clone(),
            signal.status_code,
        )
    }
}

impl fmt::Debug for LimitCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitCheckResult")
            .field("requests_remaining", &self.requests_remaining)
            .field("retry_after_seconds", &self.retry_after_seconds)
            .field("counter_id", &self.counter_id)
            .field("status_code", &self.status_code)
            .field("rule", &self.rule.as_ref().map(|r| r.display_name()))
            .finish()
    }
}

/// The exceeded result with the longest retry-after. Ties go to the earliest.
pub fn worst_of(results: &[LimitCheckResult]) -> Option<&LimitCheckResult> {
    let mut worst: Option<&LimitCheckResult> = None;
    for result in results.iter().filter(|r| r.is_exceeded()) {
        match worst {
            Some(current) if current.retry_after_seconds >= result.retry_after_seconds => {}
            _ => worst = Some(result),
        }
    }
    worst
}

/// Overall decision for one request.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Matched the whitelist; no rule was evaluated
    Whitelisted,
    /// No matching rule was exceeded
    Allowed,
    /// The aggregated exceeded result
    Exceeded(LimitCheckResult),
}

impl Verdict {
    pub fn from_results(results: &[LimitCheckResult]) -> Self {
        match worst_of(results) {
            Some(worst) => Verdict::Exceeded(worst.clone()),
            None => Verdict::Allowed,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        matches!(self, Verdict::Exceeded(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Whitelisted => write!(f, "whitelisted"),
            Verdict::Allowed => write!(f, "allowed"),
            Verdict::Exceeded(r) => write!(
                f,
                "exceeded status={} retry_after={}s counter={}",
                r.status_code, r.retry_after_seconds, r.counter_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(remaining: i64, retry_after: u64, id: &str) -> LimitCheckResult {
        LimitCheckResult::propagated(remaining, retry_after, id.to_string(), 429)
    }

    #[test]
    fn test_longest_retry_after_wins() {
        let results = vec![result(-1, 5, "a"), result(-1, 10, "b"), result(3, 60, "c")];
        match Verdict::from_results(&results) {
            Verdict::Exceeded(r) => {
                assert_eq!(r.retry_after_seconds, 10);
                assert_eq!(r.counter_id, "b");
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_ties_go_to_first() {
        let results = vec![result(-1, 10, "a"), result(-2, 10, "b")];
        assert_eq!(worst_of(&results).unwrap().counter_id, "a");
    }

    #[test]
    fn test_nothing_exceeded() {
        let results = vec![result(0, 10, "a")];
        assert!(!Verdict::from_results(&results).is_exceeded());
        assert!(!Verdict::from_results(&[]).is_exceeded());
    }

    #[test]
    fn test_signal_round_trip_keeps_status() {
        let signal = result(-1, 7, "x").to_signal();
        let back = LimitCheckResult::from(&signal);
        assert_eq!(back.retry_after_seconds, 7);
        assert_eq!(back.status_code, 429);
        assert!(back.is_exceeded());
        assert!(back.rule.is_none());
    }
}
