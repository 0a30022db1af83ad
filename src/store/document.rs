//! Counter store over a document database with conditional patches.
//!
//! An increment never reads first. Instead three conditional writes race
//! against the same document:
//!
//! - create: succeeds only if the document does not exist
//! - increment: succeeds only if the document is live
//! - reset: succeeds only if the document has expired
//!
//! Each attempt carries a fresh nonce, and the winning write stamps it on the
//! document. The increment and reset conditions both require "nonce differs",
//! so once one of the three has applied, the other two can no longer match,
//! even when all three are in flight at once against a missing document.
//! The first write to succeed supplies the new count; the rest are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{Backoff, CounterRecord, CounterStore};
use crate::clock::{system_clock, SharedClock};
use crate::error::{Result, ThrottleError};

/// The stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDocument {
    #[serde(flatten)]
    pub record: CounterRecord,
    /// Tag of the last write that touched the document
    pub nonce: String,
}

/// Filter predicate evaluated server-side before a patch applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    ExpiresAfter(i64),
    ExpiresAtOrBefore(i64),
    NonceNot(String),
    CountAbove(i64),
    CountAtMost(i64),
}

impl Predicate {
    pub fn holds(&self, doc: &CounterDocument) -> bool {
        match self {
            Predicate::ExpiresAfter(t) => doc.record.expires_at > *t,
            Predicate::ExpiresAtOrBefore(t) => doc.record.expires_at <= *t,
            Predicate::NonceNot(n) => &doc.nonce != n,
            Predicate::CountAbove(c) => doc.record.count > *c,
            Predicate::CountAtMost(c) => doc.record.count <= *c,
        }
    }
}

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    Increment(i64),
    SetCount(i64),
    SetExpiresAt(i64),
    SetNonce(String),
}

impl PatchOp {
    pub fn apply(&self, doc: &mut CounterDocument) {
        match self {
            PatchOp::Increment(by) => doc.record.count += by,
            PatchOp::SetCount(c) => doc.record.count = *c,
            PatchOp::SetExpiresAt(t) => doc.record.expires_at = *t,
            PatchOp::SetNonce(n) => doc.nonce = n.clone(),
        }
    }
}

/// Minimal document-service surface needed for counters.
///
/// A failed precondition, a missing document on patch, or an existing
/// document on create are all reported as `Ok(None)`.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    async fn read(&self, id: &str) -> Result<Option<CounterDocument>>;

    async fn create(&self, id: &str, doc: CounterDocument) -> Result<Option<CounterDocument>>;

    /// Atomically apply `ops` if every predicate in `when` holds.
    async fn patch(
        &self,
        id: &str,
        when: &[Predicate],
        ops: &[PatchOp],
    ) -> Result<Option<CounterDocument>>;
}

/// In-process document collection used for tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryDocuments {
    docs: Mutex<HashMap<String, CounterDocument>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentClient for InMemoryDocuments {
    async fn read(&self, id: &str) -> Result<Option<CounterDocument>> {
        tokio::task::yield_now().await;
        Ok(self.docs.lock().get(id).cloned())
    }

    async fn create(&self, id: &str, doc: CounterDocument) -> Result<Option<CounterDocument>> {
        tokio::task::yield_now().await;
        let mut docs = self.docs.lock();
        if docs.contains_key(id) {
            return Ok(None);
        }
        docs.insert(id.to_string(), doc.clone());
        Ok(Some(doc))
    }

    async fn patch(
        &self,
        id: &str,
        when: &[Predicate],
        ops: &[PatchOp],
    ) -> Result<Option<CounterDocument>> {
        tokio::task::yield_now().await;
        let mut docs = self.docs.lock();
        let Some(doc) = docs.get_mut(id) else {
            return Ok(None);
        };
        if !when.iter().all(|p| p.holds(doc)) {
            return Ok(None);
        }
        for op in ops {
            op.apply(doc);
        }
        Ok(Some(doc.clone()))
    }
}

/// Counter store built on nonce-tagged conditional patches.
pub struct DocumentCounterStore<C: DocumentClient> {
    client: Arc<C>,
    clock: SharedClock,
    backoff: Backoff,
}

impl<C: DocumentClient> DocumentCounterStore<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self::with_clock(client, system_clock())
    }

    pub fn with_clock(client: Arc<C>, clock: SharedClock) -> Self {
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

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Race create/increment/reset once. `Ok(None)` means every write lost.
    async fn race_once(
        &self,
        key: &str,
        cost: i64,
        now: i64,
        expires_at: i64,
    ) -> Result<Option<CounterDocument>> {
        let nonce = Uuid::new_v4().to_string();

        let create = self.client.create(
            key,
            CounterDocument {
                record: CounterRecord {
                    count: cost,
                    expires_at,
                },
                nonce: nonce.clone(),
            },
        );

        let increment_when = [Predicate::ExpiresAfter(now), Predicate::NonceNot(nonce.clone())];
        let increment_ops = [PatchOp::Increment(cost), PatchOp::SetNonce(nonce.clone())];
        let increment = self.client.patch(key, &increment_when, &increment_ops);

        let reset_when = [
            Predicate::ExpiresAtOrBefore(now),
            Predicate::NonceNot(nonce.clone()),
        ];
        let reset_ops = [
            PatchOp::SetCount(cost),
            PatchOp::SetExpiresAt(expires_at),
            PatchOp::SetNonce(nonce.clone()),
        ];
        let reset = self.client.patch(key, &reset_when, &reset_ops);

        let mut racers: FuturesUnordered<_> =
            [create.boxed(), increment.boxed(), reset.boxed()].into_iter().collect();

        let mut failure = None;
        while let Some(outcome) = racers.next().await {
            match outcome {
                Ok(Some(doc)) => return Ok(Some(doc)),
                Ok(None) => {}
                Err(e) => failure = Some(e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<C: DocumentClient> CounterStore for DocumentCounterStore<C> {
    async fn get(&self, key: &str) -> Result<i64> {
        let now = self.clock.now_millis();
        Ok(self
            .client
            .read(key)
            .await?
            .filter(|doc| doc.record.is_live(now))
            .map(|doc| doc.record.count)
            .unwrap_or(0))
    }

    async fn increment_and_get(
        &self,
        key: &str,
        cost: i64,
        expires_at: DateTime<Utc>,
        max_count_to_renew_ttl: i64,
    ) -> Result<i64> {
        let expires_at = expires_at.timestamp_millis();

        for attempt in 0..self.backoff.max_attempts {
            let now = self.clock.now_millis();
            let Some(doc) = self.race_once(key, cost, now, expires_at).await? else {
                debug!(key = %key, attempt = attempt, "All conditional writes lost, retrying");
                self.backoff.wait(attempt).await;
                continue;
            };

            let count = doc.record.count;
            if count <= max_count_to_renew_ttl && doc.record.expires_at != expires_at {
                // Renewal is best effort: a concurrent increment past the
                // threshold makes the predicate fail, which is what we want.
                self.client
                    .patch(
                        key,
                        &[
                            Predicate::ExpiresAfter(now),
                            Predicate::CountAtMost(max_count_to_renew_ttl),
                        ],
                        &[PatchOp::SetExpiresAt(expires_at)],
                    )
                    .await?;
            }

            trace!(key = %key, count = count, "Incremented document counter");
            return Ok(count);
        }

        Err(ThrottleError::Conflict {
            key: key.to_string(),
            attempts: self.backoff.max_attempts,
        })
    }

    async fn decrement(&self, key: &str, cost: i64) -> Result<()> {
        for attempt in 0..self.backoff.max_attempts {
            let now = self.clock.now_millis();

            let subtracted = self
                .client
                .patch(
                    key,
                    &[Predicate::ExpiresAfter(now), Predicate::CountAbove(cost)],
                    &[PatchOp::Increment(-cost)],
                )
                .await?;
            if subtracted.is_some() {
                return Ok(());
            }

            let cleared = self
                .client
                .patch(
                    key,
                    &[
                        Predicate::ExpiresAfter(now),
                        Predicate::CountAtMost(cost),
                        Predicate::CountAbove(0),
                    ],
                    &[PatchOp::SetCount(0)],
                )
                .await?;
            if cleared.is_some() {
                return Ok(());
            }

            match self.client.read(key).await? {
                Some(doc) if doc.record.is_live(now) && doc.record.count > 0 => {
                    debug!(
                        key = %key,
                        attempt = attempt,
                        "Document counter moved during decrement, retrying"
                    );
                    self.backoff.wait(attempt).await;
                }
                _ => return Ok(()),
            }
        }

        Err(ThrottleError::Conflict {
            key: key.to_string(),
            attempts: self.backoff.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::time::Duration;

    fn store() -> (Arc<DocumentCounterStore<InMemoryDocuments>>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = DocumentCounterStore::with_clock(
            Arc::new(InMemoryDocuments::new()),
            Arc::new(clock.clone()),
        )
        .with_backoff(Backoff::new(50, Duration::from_millis(1), Duration::from_millis(5)));
        (Arc::new(store), clock)
    }

    #[tokio::test]
    async fn test_first_increment_creates_document() {
        let (store, clock) = store();
        let ttl = clock.now() + chrono::Duration::seconds(10);

        assert_eq!(store.increment_and_get("k", 2, ttl, 10).await.unwrap(), 2);
        assert_eq!(store.client().len(), 1);
        assert_eq!(store.increment_and_get("k", 1, ttl, 10).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_expired_document_is_reset() {
        let (store, clock) = store();
        let ttl = clock.now() + chrono::Duration::seconds(1);
        store.increment_and_get("k", 5, ttl, 10).await.unwrap();

        clock.advance_secs(1);
        assert_eq!(store.get("k").await.unwrap(), 0);

        let ttl = clock.now() + chrono::Duration::seconds(1);
        assert_eq!(store.increment_and_get("k", 1, ttl, 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_renewal_stops_above_threshold() {
        let (store, clock) = store();
        let first = clock.now() + chrono::Duration::seconds(2);
        store.increment_and_get("k", 1, first, 1).await.unwrap();

        let later = clock.now() + chrono::Duration::seconds(30);
        store.increment_and_get("k", 1, later, 1).await.unwrap();

        let doc = store.client().read("k").await.unwrap().unwrap();
        assert_eq!(doc.record.expires_at, first.timestamp_millis());
    }

    #[tokio::test]
    async fn test_decrement_floors_at_zero() {
        let (store, clock) = store();
        let ttl = clock.now() + chrono::Duration::seconds(10);
        store.increment_and_get("k", 3, ttl, 10).await.unwrap();

        store.decrement("k", 2).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 1);

        store.decrement("k", 2).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 0);

        // Nothing left to release
        store.decrement("k", 1).await.unwrap();
        store.decrement("missing", 1).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_writers_lose_nothing() {
        let (store, clock) = store();
        let ttl = clock.now() + chrono::Duration::seconds(60);

        let tasks: Vec<_> = (0..25)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_and_get("k", 1, ttl, 1_000).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.get("k").await.unwrap(), 25);
    }

    #[test]
    fn test_nonce_blocks_second_write_of_same_attempt() {
        let doc = CounterDocument {
            record: CounterRecord { count: 1, expires_at: 100 },
            nonce: "n1".to_string(),
        };
        assert!(!Predicate::NonceNot("n1".to_string()).holds(&doc));
        assert!(Predicate::NonceNot("n2".to_string()).holds(&doc));
    }
}
