//! Redis-backed counter store.
//!
//! Both mutating operations run as server-side Lua scripts so the increment
//! and the conditional expiry (or the decrement and the delete) happen in one
//! round trip with no interleaving.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script, ScriptInvocation};
use tracing::{info, trace};

use super::CounterStore;
use crate::error::Result;

/// KEYS[1] = counter, ARGV[1] = cost, ARGV[2] = expiry (epoch ms),
/// ARGV[3] = max count that still renews the expiry.
///
/// A counter that somehow lost its expiry always gets one, so a key created
/// above the threshold can never live forever.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count <= tonumber(ARGV[3]) or redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIREAT', KEYS[1], ARGV[2])
end
return count
"#;

/// KEYS[1] = counter, ARGV[1] = cost.
const DECREMENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
local count = redis.call('DECRBY', KEYS[1], ARGV[1])
if count < 1 then
    redis.call('DEL', KEYS[1])
    return 0
end
return count
"#;

/// Counter store backed by a single Redis endpoint.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    key_prefix: String,
    increment: Script,
    decrement: Script,
}

impl RedisCounterStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected counter store to Redis");
        Ok(Self::with_connection(conn, key_prefix))
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            increment: Script::new(INCREMENT_SCRIPT),
            decrement: Script::new(DECREMENT_SCRIPT),
        }
    }

    fn full_key(&self, key: &str) -> String {
        prefixed_key(&self.key_prefix, key)
    }
}

/// ARGV for [`INCREMENT_SCRIPT`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IncrementArgs {
    cost: i64,
    expires_at_millis: i64,
    max_count_to_renew_ttl: i64,
}

impl IncrementArgs {
    fn new(cost: i64, expires_at: DateTime<Utc>, max_count_to_renew_ttl: i64) -> Self {
        Self {
            cost,
            // PEXPIREAT with a past timestamp deletes the key outright
            expires_at_millis: expires_at.timestamp_millis().max(0),
            max_count_to_renew_ttl,
        }
    }

    fn apply(&self, invocation: &mut ScriptInvocation<'_>) {
        invocation
            .arg(self.cost)
            .arg(self.expires_at_millis)
            .arg(self.max_count_to_renew_ttl);
    }
}

fn prefixed_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}", prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(self.full_key(key)).await?;
        Ok(value.unwrap_or(0).max(0))
    }

    async fn increment_and_get(
        &self,
        key: &str,
        cost: i64,
        expires_at: DateTime<Utc>,
        max_count_to_renew_ttl: i64,
    ) -> Result<i64> {
        let mut conn = self.conn.clone();
        let full_key = self.full_key(key);
        let mut invocation = self.increment.key(&full_key);
        IncrementArgs::new(cost, expires_at, max_count_to_renew_ttl).apply(&mut invocation);
        let count: i64 = invocation.invoke_async(&mut conn).await?;

        trace!(key = %full_key, count = count, "Incremented Redis counter");
        Ok(count)
    }

    async fn decrement(&self, key: &str, cost: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .decrement
            .key(self.full_key(key))
            .arg(cost)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_prefixed_key() {
        assert_eq!(prefixed_key("", "abc"), "abc");
        assert_eq!(prefixed_key("tg:", "abc"), "tg:abc");
    }

    #[test]
    fn test_increment_args() {
        let expires_at = Utc.timestamp_millis_opt(1_700_000_060_500).unwrap();
        let args = IncrementArgs::new(3, expires_at, 10);
        assert_eq!(
            args,
            IncrementArgs {
                cost: 3,
                expires_at_millis: 1_700_000_060_500,
                max_count_to_renew_ttl: 10,
            }
        );

        // An unbounded threshold passes through unchanged
        let args = IncrementArgs::new(1, expires_at, i64::MAX);
        assert_eq!(args.max_count_to_renew_ttl, i64::MAX);

        let before_epoch = Utc.timestamp_millis_opt(-5_000).unwrap();
        assert_eq!(IncrementArgs::new(1, before_epoch, 1).expires_at_millis, 0);
    }

    #[test]
    fn test_scripts_have_distinct_hashes() {
        let inc = Script::new(INCREMENT_SCRIPT);
        let dec = Script::new(DECREMENT_SCRIPT);
        assert_ne!(inc.get_hash(), dec.get_hash());
    }
}
