//! Error types for the Throttlegate engine.

use thiserror::Error;

/// Signal raised by an egress gate when a throttled outbound call should
/// throttle the inbound request that triggered it.
///
/// The ingress gate looks for this value anywhere in the `source()` chain of
/// the error returned by the protected work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Too many requests, retry after {retry_after_seconds} seconds")]
pub struct TooManyRequests {
    /// Suggested delay before retrying
    pub retry_after_seconds: u64,
    /// Counter that triggered the throttling
    pub counter_id: String,
    /// Status code the ingress side should render (429 or 503)
    pub status_code: u16,
}

/// Main error type for Throttlegate operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Settings loading errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid rate limit method parameters
    #[error("Invalid rate limit method: {0}")]
    InvalidMethod(String),

    /// A request could not be built from its parts
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid URI pattern
    #[error("Invalid URI pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Generic counter store failure
    #[error("Counter store error: {0}")]
    Store(String),

    /// Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Concurrency conflicts that did not resolve within the retry budget
    #[error("Counter {key} still conflicting after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },

    /// Throttling decision propagated from egress to ingress
    #[error("{0}")]
    TooManyRequests(#[from] TooManyRequests),

    /// The caller cancelled the evaluation
    #[error("Evaluation cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Throttlegate operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;

/// Walk an error's `source()` chain looking for a propagated throttling signal.
pub fn find_too_many_requests<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a TooManyRequests> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(signal) = e.downcast_ref::<TooManyRequests>() {
            return Some(signal);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("downstream call failed")]
    struct Downstream(#[source] ThrottleError);

    #[test]
    fn test_find_signal_in_source_chain() {
        let signal = TooManyRequests {
            retry_after_seconds: 7,
            counter_id: "abc".to_string(),
            status_code: 429,
        };
        let err = Downstream(ThrottleError::TooManyRequests(signal.clone()));

        let found = find_too_many_requests(&err).unwrap();
        assert_eq!(found, &signal);
    }

    #[test]
    fn test_no_signal_for_plain_errors() {
        let err = Downstream(ThrottleError::Store("boom".to_string()));
        assert!(find_too_many_requests(&err).is_none());
    }
}
