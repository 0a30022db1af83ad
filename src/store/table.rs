//! Counter store over an optimistic-concurrency table service.
//!
//! Every update is a read-modify-write guarded by the row's entity tag. A
//! writer that loses the race re-reads and retries after a randomized
//! backoff. Expired rows are never deleted on the hot path; a background
//! sweep removes rows that expired more than a grace window ago.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{spawn_periodic, Backoff, CounterRecord, CounterStore};
use crate::clock::{system_clock, SharedClock};
use crate::error::{Result, ThrottleError};

/// A row together with its current entity tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: CounterRecord,
    pub etag: String,
}

/// Minimal table-service surface needed for counters.
///
/// Conditional writes report a lost race as `Ok(false)`; `Err` is reserved
/// for transport or service failures.
#[async_trait]
pub trait TableClient: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>>;

    /// Insert a new row; `false` when the row already exists.
    async fn insert(&self, key: &str, record: CounterRecord) -> Result<bool>;

    /// Replace a row if its entity tag still matches.
    async fn replace(&self, key: &str, record: CounterRecord, etag: &str) -> Result<bool>;

    /// Delete a row if its entity tag still matches.
    async fn delete(&self, key: &str, etag: &str) -> Result<bool>;

    /// Up to `limit` rows whose expiry is before `before_millis`.
    async fn list_expired(&self, before_millis: i64, limit: usize) -> Result<Vec<(String, String)>>;
}

/// In-process table used for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryTable {
    rows: Mutex<HashMap<String, VersionedRecord>>,
}

impl InMemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_etag() -> String {
        Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl TableClient for InMemoryTable {
    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>> {
        tokio::task::yield_now().await;
        Ok(self.rows.lock().get(key).cloned())
    }

    async fn insert(&self, key: &str, record: CounterRecord) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut rows = self.rows.lock();
        if rows.contains_key(key) {
            return Ok(false);
        }
        rows.insert(
            key.to_string(),
            VersionedRecord {
                record,
                etag: Self::new_etag(),
            },
        );
        Ok(true)
    }

    async fn replace(&self, key: &str, record: CounterRecord, etag: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut rows = self.rows.lock();
        match rows.get_mut(key) {
            Some(row) if row.etag == etag => {
                row.record = record;
                row.etag = Self::new_etag();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str, etag: &str) -> Result<bool> {
        let mut rows = self.rows.lock();
        match rows.get(key) {
            Some(row) if row.etag == etag => {
                rows.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_expired(
        &self,
        before_millis: i64,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|(_, row)| row.record.expires_at < before_millis)
            .take(limit)
            .map(|(key, row)| (key.clone(), row.etag.clone()))
            .collect())
    }
}

/// Counter store implemented with optimistic concurrency.
pub struct TableCounterStore<T: TableClient> {
    client: Arc<T>,
    clock: SharedClock,
    backoff: Backoff,
}

impl<T: TableClient + 'static> TableCounterStore<T> {
    pub fn new(client: Arc<T>) -> Self {
        Self::with_clock(client, system_clock())
    }

    pub fn with_clock(client: Arc<T>, clock: SharedClock) -> Self {
        Self {
            client,
            clock,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn client(&self) -> &Arc<T> {
        &self.client
    }

    /// Delete rows that expired more than `grace` ago, `batch_size` at a time.
    pub async fn cleanup_expired(&self, grace: Duration, batch_size: usize) -> Result<usize> {
        let before = self.clock.now_millis() - grace.as_millis() as i64;
        let batch_size = batch_size.max(1);
        let mut removed = 0;

        loop {
            let batch = self.client.list_expired(before, batch_size).await?;
            let batch_len = batch.len();
            for (key, etag) in batch {
                // A row renewed since listing keeps a different tag and survives
                if self.client.delete(&key, &etag).await? {
                    removed += 1;
                }
            }
            if batch_len < batch_size {
                break;
            }
        }

        if removed > 0 {
            debug!(removed = removed, "Removed expired table counters");
        }
        Ok(removed)
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval` until
    /// `shutdown` fires.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        interval: Duration,
        grace: Duration,
        batch_size: usize,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Starting table counter cleanup");
        spawn_periodic(interval, shutdown, move || {
            let store = self.clone();
            async move {
                if let Err(e) = store.cleanup_expired(grace, batch_size).await {
                    warn!(error = %e, "Table counter cleanup failed");
                }
            }
        })
    }
}

#[async_trait]
impl<T: TableClient + 'static> CounterStore for TableCounterStore<T> {
    async fn get(&self, key: &str) -> Result<i64> {
        let now = self.clock.now_millis();
        Ok(self
            .client
            .read(key)
            .await?
            .filter(|row| row.record.is_live(now))
            .map(|row| row.record.count)
            .unwrap_or(0))
    }

    async fn increment_and_get(
        &self,
        key: &str,
        cost: i64,
        expires_at: DateTime<Utc>,
        max_count_to_renew_ttl: i64,
    ) -> Result<i64> {
        for attempt in 0..self.backoff.max_attempts {
            let now = self.clock.now_millis();
            let current = self.client.read(key).await?;
            let next = CounterRecord::incremented(
                current.as_ref().map(|row| row.record),
                now,
                cost,
                expires_at,
                max_count_to_renew_ttl,
            );

            let written = match &current {
                None => self.client.insert(key, next).await?,
                Some(row) => self.client.replace(key, next, &row.etag).await?,
            };
            if written {
                return Ok(next.count);
            }

            debug!(key = %key, attempt = attempt, "Table counter conflict, retrying");
            self.backoff.wait(attempt).await;
        }

        Err(ThrottleError::Conflict {
            key: key.to_string(),
            attempts: self.backoff.max_attempts,
        })
    }

    async fn decrement(&self, key: &str, cost: i64) -> Result<()> {
        for attempt in 0..self.backoff.max_attempts {
            let now = self.clock.now_millis();
            let row = match self.client.read(key).await? {
                Some(row) if row.record.is_live(now) && row.record.count > 0 => row,
                _ => return Ok(()),
            };

            let next = CounterRecord {
                count: (row.record.count - cost).max(0),
                expires_at: row.record.expires_at,
            };
            if self.client.replace(key, next, &row.etag).await? {
                return Ok(());
            }

            debug!(key = %key, attempt = attempt, "Table counter conflict on decrement, retrying");
            self.backoff.wait(attempt).await;
        }

        Err(ThrottleError::Conflict {
            key: key.to_string(),
            attempts: self.backoff.max_attempts,
        })
    }
}
