//! Process-local counter store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::trace;

use super::{CounterRecord, CounterStore};
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;

/// Expired records are swept every this many mutations.
const PURGE_EVERY: u64 = 1024;

/// Counter store kept in process memory behind a single mutex.
///
/// Used for limits that are intentionally per-instance, such as circuit
/// breaker failure counts, and as the default store for single-node setups.
pub struct MemoryCounterStore {
    clock: SharedClock,
    entries: Mutex<HashMap<String, CounterRecord>>,
    mutations: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            mutations: AtomicU64::new(0),
        }
    }

    /// Drop a counter regardless of its state.
    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Number of stored records, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records that have not expired.
    pub fn live_len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.lock().values().filter(|r| r.is_live(now)).count()
    }

    fn maybe_purge(&self, entries: &mut HashMap<String, CounterRecord>, now: i64) {
        if self.mutations.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            let before = entries.len();
            entries.retain(|_, record| record.is_live(now));
            trace!(removed = before - entries.len(), "Purged expired counters");
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<i64> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.count)
            .unwrap_or(0))
    }

    async fn increment_and_get(
        &self,
        key: &str,
        cost: i64,
        expires_at: DateTime<Utc>,
        max_count_to_renew_ttl: i64,
    ) -> Result<i64> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let record = CounterRecord::incremented(
            entries.get(key).copied(),
            now,
            cost,
            expires_at,
            max_count_to_renew_ttl,
        );
        entries.insert(key.to_string(), record);
        self.maybe_purge(&mut entries, now);
        Ok(record.count)
    }

    async fn decrement(&self, key: &str, cost: i64) -> Result<()> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(record) if record.is_live(now) => {
                if record.count - cost <= 0 {
                    entries.remove(key);
                } else {
                    record.count -= cost;
                }
            }
            Some(_) => {
                entries.remove(key);
            }
            None => {}
        }
        self.maybe_purge(&mut entries, now);
        Ok(())
    }
}
