//! Bounded, randomized retry backoff for contended counter updates.

use std::time::Duration;

use rand::Rng;

/// Retry budget shared by the optimistic and conditional-patch backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Smallest delay between attempts
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base: Duration::from_millis(5),
            max: Duration::from_millis(200),
        }
    }
}

impl Backoff {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max: max.max(base),
        }
    }

    /// Random delay in `[base, min(base * 2^attempt, max)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as u64;
        let ceiling = base
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max.as_millis() as u64)
            .max(base);
        let millis = rand::thread_rng().gen_range(base..=ceiling);
        Duration::from_millis(millis)
    }

    /// Sleep before the next attempt.
    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_bounded() {
        let backoff = Backoff::new(5, Duration::from_millis(10), Duration::from_millis(50));
        for attempt in 0..20 {
            let delay = backoff.delay(attempt);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_first_attempt_uses_base() {
        let backoff = Backoff::new(3, Duration::from_millis(8), Duration::from_millis(100));
        assert!(backoff.delay(0) <= Duration::from_millis(8));
    }

    #[test]
    fn test_attempts_at_least_one() {
        assert_eq!(Backoff::new(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
    }
}
