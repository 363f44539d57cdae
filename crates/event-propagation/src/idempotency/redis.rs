//! Redis-backed idempotency store.
//!
//! Outcomes live in one hash per consumer group, `{prefix}:idempotency:{group}:outcomes`,
//! holding JSON-encoded [`ConsumerRecord`]s. Claims are plain keys with a
//! millisecond expiry. Every read-modify-write runs as a Lua script, so a
//! claim check and the write it guards are a single atomic step on the
//! server.

use super::{Claim, ConsumerRecord, IdempotencyStore, Outcome};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::collections::HashMap;
use std::time::Duration;

const TRY_CLAIM: &str = r#"
local record = redis.call('HGET', KEYS[1], ARGV[1])
if record then
  local ok, decoded = pcall(cjson.decode, record)
  if ok and (decoded['outcome'] == 'SUCCEEDED' or decoded['outcome'] == 'DEAD_LETTERED') then
    return {'completed', record}
  end
end
local holder = redis.call('GET', KEYS[2])
if holder and holder ~= ARGV[2] then
  return {'busy', holder}
end
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
return {'acquired', ''}
"#;

const RECORD_OUTCOME: &str = r#"
if redis.call('GET', KEYS[2]) == ARGV[2] then
  redis.call('DEL', KEYS[2])
end
redis.call('SADD', KEYS[3], ARGV[4])
local existing = redis.call('HGET', KEYS[1], ARGV[1])
if existing then
  local ok, decoded = pcall(cjson.decode, existing)
  if ok and (decoded['outcome'] == 'SUCCEEDED' or decoded['outcome'] == 'DEAD_LETTERED') then
    return existing
  end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return ARGV[3]
"#;

const RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Idempotency store shared by every replica connected to the same Redis.
///
/// # Example
///
/// ```rust,no_run
/// use event_propagation::idempotency::redis::RedisIdempotencyStore;
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let store = RedisIdempotencyStore::connect("redis://localhost:6379", "propagation").await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: MultiplexedConnection,
    prefix: String,
    try_claim: Script,
    record_outcome: Script,
    release: Script,
}

impl std::fmt::Debug for RedisIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisIdempotencyStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisIdempotencyStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., `redis://localhost:6379`)
    /// * `prefix` - Key prefix shared with the transport (e.g., `propagation`)
    pub async fn connect(redis_url: &str, prefix: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Self::from_connection(conn, prefix))
    }

    /// Build from an existing connection.
    pub fn from_connection(conn: MultiplexedConnection, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            try_claim: Script::new(TRY_CLAIM),
            record_outcome: Script::new(RECORD_OUTCOME),
            release: Script::new(RELEASE),
        }
    }

    fn outcomes_key(&self, consumer_group: &str) -> String {
        format!("{}:idempotency:{}:outcomes", self.prefix, consumer_group)
    }

    fn claim_key(&self, consumer_group: &str, dedup_key: &str) -> String {
        format!("{}:idempotency:{}:claim:{}", self.prefix, consumer_group, dedup_key)
    }

    fn groups_key(&self) -> String {
        format!("{}:idempotency:groups", self.prefix)
    }

    fn decode(dedup_key: &str, raw: &str) -> StoreResult<ConsumerRecord> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: dedup_key.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn lookup(&self, consumer_group: &str, dedup_key: &str) -> StoreResult<Option<ConsumerRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(self.outcomes_key(consumer_group), dedup_key)
            .await
            .map_err(unavailable)?;
        raw.map(|raw| Self::decode(dedup_key, &raw)).transpose()
    }

    async fn try_claim(
        &self,
        consumer_group: &str,
        dedup_key: &str,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<Claim> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .try_claim
            .key(self.outcomes_key(consumer_group))
            .key(self.claim_key(consumer_group, dedup_key))
            .arg(dedup_key)
            .arg(owner)
            .arg(lease.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match reply.as_slice() {
            [status, _] if status == "acquired" => Ok(Claim::Acquired),
            [status, holder] if status == "busy" => Ok(Claim::Busy {
                owner: holder.clone(),
            }),
            [status, raw] if status == "completed" => {
                Ok(Claim::Completed(Self::decode(dedup_key, raw)?))
            }
            other => Err(StoreError::Corrupt {
                key: dedup_key.to_string(),
                message: format!("unexpected claim reply: {:?}", other),
            }),
        }
    }

    async fn record_outcome(
        &self,
        consumer_group: &str,
        dedup_key: &str,
        outcome: Outcome,
        attempt: u32,
        owner: &str,
    ) -> StoreResult<ConsumerRecord> {
        let record = ConsumerRecord::new(consumer_group, dedup_key, outcome, attempt);
        let encoded = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
            key: dedup_key.to_string(),
            message: e.to_string(),
        })?;

        let mut conn = self.conn.clone();
        let stored: String = self
            .record_outcome
            .key(self.outcomes_key(consumer_group))
            .key(self.claim_key(consumer_group, dedup_key))
            .key(self.groups_key())
            .arg(dedup_key)
            .arg(owner)
            .arg(&encoded)
            .arg(consumer_group)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Self::decode(dedup_key, &stored)
    }

    async fn release(&self, consumer_group: &str, dedup_key: &str, owner: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(self.claim_key(consumer_group, dedup_key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let groups: Vec<String> = conn.smembers(self.groups_key()).await.map_err(unavailable)?;

        let mut purged = 0;
        for group in groups {
            let key = self.outcomes_key(&group);
            let records: HashMap<String, String> = conn.hgetall(&key).await.map_err(unavailable)?;

            let stale: Vec<&String> = records
                .iter()
                .filter(|(field, raw)| match Self::decode(field, raw) {
                    Ok(record) => record.recorded_at < cutoff,
                    Err(e) => {
                        tracing::warn!(consumer_group = %group, error = %e, "Dropping undecodable record");
                        true
                    }
                })
                .map(|(field, _)| field)
                .collect();

            if !stale.is_empty() {
                let removed: usize = conn.hdel(&key, stale).await.map_err(unavailable)?;
                purged += removed;
            }
        }

        tracing::debug!(purged, cutoff = %cutoff, "Purged idempotency records");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    async fn store() -> RedisIdempotencyStore {
        let prefix = format!("propagation-test-{}", uuid::Uuid::now_v7());
        RedisIdempotencyStore::connect(&redis_url(), &prefix)
            .await
            .expect("redis available")
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_claim_record_and_skip() {
        let store = store().await;
        let lease = Duration::from_secs(5);

        assert_eq!(
            store.try_claim("inventory", "e1", "r1", lease).await.unwrap(),
            Claim::Acquired
        );
        assert!(matches!(
            store.try_claim("inventory", "e1", "r2", lease).await.unwrap(),
            Claim::Busy { owner } if owner == "r1"
        ));

        store
            .record_outcome("inventory", "e1", Outcome::Succeeded, 1, "r1")
            .await
            .unwrap();
        assert!(matches!(
            store.try_claim("inventory", "e1", "r2", lease).await.unwrap(),
            Claim::Completed(record) if record.attempt == 1
        ));

        let stored = store
            .record_outcome("inventory", "e1", Outcome::Failed, 2, "r2")
            .await
            .unwrap();
        assert_eq!(stored.outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_release_and_purge() {
        let store = store().await;
        let lease = Duration::from_secs(5);

        store.try_claim("inventory", "e1", "r1", lease).await.unwrap();
        store.release("inventory", "e1", "r1").await.unwrap();
        assert_eq!(
            store.try_claim("inventory", "e1", "r2", lease).await.unwrap(),
            Claim::Acquired
        );

        store
            .record_outcome("inventory", "e1", Outcome::Succeeded, 1, "r2")
            .await
            .unwrap();
        let purged = store
            .purge_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.lookup("inventory", "e1").await.unwrap().is_none());
    }
}
