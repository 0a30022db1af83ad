//! Counter store over a transactional relational database.
//!
//! Each mutation runs as `SELECT` + `UPSERT`/`DELETE` inside one
//! `REPEATABLE READ` transaction. The lock taken by the `SELECT` is held
//! until commit, which serializes concurrent writers of the same key.
//! Expired rows are removed by a periodic, batched cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{spawn_periodic, CounterRecord, CounterStore};
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;

/// Transaction isolation levels understood by [`SqlBackend::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Whether reads keep their locks until the transaction ends.
    pub fn holds_read_locks(&self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }
}

/// One open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait SqlTransaction: Send {
    async fn select_counter(&mut self, key: &str) -> Result<Option<CounterRecord>>;

    async fn upsert_counter(&mut self, key: &str, record: CounterRecord) -> Result<()>;

    async fn delete_counter(&mut self, key: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Connection-pool level operations.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn SqlTransaction>>;

    /// Delete at most `batch_size` rows expired before `before_millis`,
    /// returning how many were removed.
    async fn delete_expired(&self, before_millis: i64, batch_size: usize) -> Result<usize>;
}

type Rows = Arc<Mutex<HashMap<String, CounterRecord>>>;
type RowLocks = Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Drop the lock entry of `key` unless a transaction holds or awaits it.
fn prune_row_lock(locks: &RowLocks, key: &str) {
    locks.remove_if(key, |_, lock| {
        Arc::strong_count(lock) == 1 && lock.try_lock().is_ok()
    });
}

/// In-process relational table with per-row locks.
#[derive(Debug, Default)]
pub struct InMemorySqlBackend {
    rows: Rows,
    locks: RowLocks,
}

impl InMemorySqlBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of row locks currently tracked.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

struct InMemoryTransaction {
    rows: Rows,
    locks: RowLocks,
    isolation: IsolationLevel,
    held: HashMap<String, OwnedMutexGuard<()>>,
    pending: HashMap<String, Option<CounterRecord>>,
}

impl InMemoryTransaction {
    async fn lock_row(&mut self, key: &str) {
        if !self.isolation.holds_read_locks() || self.held.contains_key(key) {
            return;
        }
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        self.held.insert(key.to_string(), guard);
    }
}

#[async_trait]
impl SqlTransaction for InMemoryTransaction {
    async fn select_counter(&mut self, key: &str) -> Result<Option<CounterRecord>> {
        self.lock_row(key).await;
        if let Some(pending) = self.pending.get(key) {
            return Ok(*pending);
        }
        tokio::task::yield_now().await;
        Ok(self.rows.lock().get(key).copied())
    }

    async fn upsert_counter(&mut self, key: &str, record: CounterRecord) -> Result<()> {
        self.lock_row(key).await;
        self.pending.insert(key.to_string(), Some(record));
        Ok(())
    }

    async fn delete_counter(&mut self, key: &str) -> Result<()> {
        self.lock_row(key).await;
        self.pending.insert(key.to_string(), None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction {
            rows,
            locks,
            held,
            pending,
            ..
        } = *self;
        let mut deleted = Vec::new();
        {
            let mut rows = rows.lock();
            for (key, value) in pending {
                match value {
                    Some(record) => {
                        rows.insert(key, record);
                    }
                    None => {
                        rows.remove(&key);
                        deleted.push(key);
                    }
                }
            }
        }
        // Row locks are released only after the writes are visible
        drop(held);
        for key in &deleted {
            prune_row_lock(&locks, key);
        }
        Ok(())
    }
}

#[async_trait]
impl SqlBackend for InMemorySqlBackend {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn SqlTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            rows: self.rows.clone(),
            locks: self.locks.clone(),
            isolation,
            held: HashMap::new(),
            pending: HashMap::new(),
        }))
    }

    async fn delete_expired(&self, before_millis: i64, batch_size: usize) -> Result<usize> {
        let mut rows = self.rows.lock();
        let expired: Vec<String> = rows
            .iter()
            .filter(|(_, r)| r.expires_at < before_millis)
            .take(batch_size)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            rows.remove(key);
            prune_row_lock(&self.locks, key);
        }
        Ok(expired.len())
    }
}

/// Counter store running every mutation in a locking transaction.
pub struct SqlCounterStore<B: SqlBackend> {
    backend: Arc<B>,
    clock: SharedClock,
}

impl<B: SqlBackend + 'static> SqlCounterStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_clock(backend, system_clock())
    }

    pub fn with_clock(backend: Arc<B>, clock: SharedClock) -> Self {
        Self { backend, clock }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Delete rows that expired more than `grace` ago, in transactions of at
    /// most `batch_size` rows.
    pub async fn cleanup_expired(&self, grace: Duration, batch_size: usize) -> Result<usize> {
        let before = self.clock.now_millis() - grace.as_millis() as i64;
        let batch_size = batch_size.max(1);
        let mut removed = 0;

        loop {
            let deleted = self.backend.delete_expired(before, batch_size).await?;
            removed += deleted;
            if deleted < batch_size {
                break;
            }
        }

        if removed > 0 {
            debug!(removed = removed, "Removed expired SQL counters");
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
        info!(interval_secs = interval.as_secs(), "Starting SQL counter cleanup");
        spawn_periodic(interval, shutdown, move || {
            let store = self.clone();
            async move {
                if let Err(e) = store.cleanup_expired(grace, batch_size).await {
                    warn!(error = %e, "SQL counter cleanup failed");
                }
            }
        })
    }
}

#[async_trait]
impl<B: SqlBackend + 'static> CounterStore for SqlCounterStore<B> {
    async fn get(&self, key: &str) -> Result<i64> {
        let now = self.clock.now_millis();
        let mut tx = self.backend.begin(IsolationLevel::ReadCommitted).await?;
        let record = tx.select_counter(key).await?;
        tx.commit().await?;
        Ok(record.filter(|r| r.is_live(now)).map(|r| r.count).unwrap_or(0))
    }

    async fn increment_and_get(
        &self,
        key: &str,
        cost: i64,
        expires_at: DateTime<Utc>,
        max_count_to_renew_ttl: i64,
    ) -> Result<i64> {
        let mut tx = self.backend.begin(IsolationLevel::RepeatableRead).await?;
        let current = tx.select_counter(key).await?;
        let now = self.clock.now_millis();
        let next =
            CounterRecord::incremented(current, now, cost, expires_at, max_count_to_renew_ttl);
        tx.upsert_counter(key, next).await?;
        tx.commit().await?;
        Ok(next.count)
    }

    async fn decrement(&self, key: &str, cost: i64) -> Result<()> {
        let mut tx = self.backend.begin(IsolationLevel::RepeatableRead).await?;
        let now = self.clock.now_millis();
        match tx.select_counter(key).await? {
            Some(record) if record.is_live(now) => {
                if record.count - cost <= 0 {
                    tx.delete_counter(key).await?;
                } else {
                    tx.upsert_counter(
                        key,
                        CounterRecord {
                            count: record.count - cost,
                            expires_at: record.expires_at,
                        },
                    )
                    .await?;
                }
            }
            _ => {}
        }
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn store() -> (Arc<SqlCounterStore<InMemorySqlBackend>>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let backend = Arc::new(InMemorySqlBackend::new());
        let store = SqlCounterStore::with_clock(backend, Arc::new(clock.clone()));
        (Arc::new(store), clock)
    }

    #[tokio::test]
    async fn test_increment_get_decrement() {
        let (store, clock) = store();
        let ttl = clock.now() + chrono::Duration::seconds(10);

        assert_eq!(store.increment_and_get("k", 1, ttl, 10).await.unwrap(), 1);
        assert_eq!(store.increment_and_get("k", 4, ttl, 10).await.unwrap(), 5);
        store.decrement("k", 2).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 3);

        store.decrement("k", 3).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 0);
        assert!(store.backend().is_empty());
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_trace() {
        let (store, _clock) = store();
        let record = CounterRecord { count: 9, expires_at: i64::MAX };
        {
            let mut tx = store.backend().begin(IsolationLevel::RepeatableRead).await.unwrap();
            tx.upsert_counter("k", record).await.unwrap();
        }
        assert_eq!(store.get("k").await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_row_lock_serializes_writers() {
        let (store, clock) = store();
        let ttl = clock.now() + chrono::Duration::seconds(60);

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_and_get("k", 1, ttl, 1_000).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.get("k").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_sweep_keeps_lock_of_open_transaction() {
        let backend = InMemorySqlBackend::new();
        backend.rows.lock().insert("k".to_string(), CounterRecord { count: 3, expires_at: 0 });

        let mut first = backend.begin(IsolationLevel::RepeatableRead).await.unwrap();
        assert!(first.select_counter("k").await.unwrap().is_some());

        assert_eq!(backend.delete_expired(1_000, 10).await.unwrap(), 1);
        assert_eq!(backend.lock_count(), 1);

        let mut second = backend.begin(IsolationLevel::RepeatableRead).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(200), second.select_counter("k")).await;
        assert!(blocked.is_err());

        first
            .upsert_counter("k", CounterRecord { count: 1, expires_at: i64::MAX })
            .await
            .unwrap();
        first.commit().await.unwrap();

        let seen = second.select_counter("k").await.unwrap();
        assert_eq!(seen.map(|r| r.count), Some(1));
    }

    #[tokio::test]
    async fn test_deleted_rows_drop_their_locks() {
        let (store, clock) = store();
        let ttl = clock.now() + chrono::Duration::seconds(10);
        store.increment_and_get("k", 1, ttl, 10).await.unwrap();
        assert_eq!(store.backend().lock_count(), 1);

        store.decrement("k", 1).await.unwrap();
        assert!(store.backend().is_empty());
        assert_eq!(store.backend().lock_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_in_batches() {
        let (store, clock) = store();
        let ttl = clock.now() + chrono::Duration::seconds(1);
        for i in 0..5 {
            store.increment_and_get(&format!("k{}", i), 1, ttl, 10).await.unwrap();
        }

        clock.advance_secs(10);
        let removed = store.cleanup_expired(Duration::from_secs(5), 2).await.unwrap();
        assert_eq!(removed, 5);
        assert!(store.backend().is_empty());
    }
}
