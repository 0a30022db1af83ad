//! Distributed counter storage.
//!
//! A counter store holds `key -> (count, expires_at)` records and exposes three
//! atomic operations. Every backend must implement them without losing
//! increments under concurrent, multi-process access; how it achieves that is
//! backend specific (process mutex, server-side script, optimistic
//! concurrency, conditional patches, row locks).

mod backoff;
pub mod document;
pub mod memory;
pub mod redis_store;
pub mod sql;
pub mod table;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use backoff::Backoff;
pub use document::DocumentCounterStore;
pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;
pub use sql::SqlCounterStore;
pub use table::TableCounterStore;

/// The logical shape of a stored counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Current count, never negative once stored
    pub count: i64,
    /// Expiry in epoch milliseconds
    pub expires_at: i64,
}

impl CounterRecord {
    pub fn new(count: i64, expires_at: DateTime<Utc>) -> Self {
        Self {
            count,
            expires_at: expires_at.timestamp_millis(),
        }
    }

    /// A record is live strictly before its expiry instant.
    pub fn is_live(&self, now_millis: i64) -> bool {
        self.expires_at > now_millis
    }

    /// Apply an increment the way every backend must: a dead record restarts
    /// at `cost`, a live one grows by `cost`, and the expiry is only renewed
    /// while the new count stays at or below `max_count_to_renew_ttl`.
    pub fn incremented(
        current: Option<CounterRecord>,
        now_millis: i64,
        cost: i64,
        expires_at: DateTime<Utc>,
        max_count_to_renew_ttl: i64,
    ) -> CounterRecord {
        let expires_at = expires_at.timestamp_millis();
        match current {
            Some(record) if record.is_live(now_millis) => {
                let count = record.count + cost;
                let expires_at = if count <= max_count_to_renew_ttl {
                    expires_at
                } else {
                    record.expires_at
                };
                CounterRecord { count, expires_at }
            }
            _ => CounterRecord {
                count: cost,
                expires_at,
            },
        }
    }
}

/// Backend-agnostic counter contract.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count for `key`; 0 when absent or expired.
    async fn get(&self, key: &str) -> Result<i64>;

    /// Atomically add `cost` to the counter, creating it at `cost` if absent or
    /// expired, and return the new count. `expires_at` is applied only when the
    /// new count is `<= max_count_to_renew_ttl`.
    async fn increment_and_get(
        &self,
        key: &str,
        cost: i64,
        expires_at: DateTime<Utc>,
        max_count_to_renew_ttl: i64,
    ) -> Result<i64>;

    /// Atomically subtract `cost`. Removes or resets the counter when the
    /// result would be `<= 0`; a no-op for absent or expired counters.
    async fn decrement(&self, key: &str, cost: i64) -> Result<()>;
}

/// Run `task` every `interval` until `shutdown` fires.
pub(crate) fn spawn_periodic<F, Fut>(
    interval: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
    mut task: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => task().await,
            }
        }
    })
}
