//! Redis Streams transport for distributed deployments.
//!
//! Each topic is a stream, `{prefix}:stream:{topic}`, and each consumer
//! group is a Redis consumer group on that stream. Envelopes are stored as
//! a single `envelope` field holding the JSON wire form.
//!
//! Pending entries (delivered, not yet `XACK`ed) stay in the group's
//! pending list on the server. A replica re-reads its own pending list on
//! every poll, so a restarted replica with the same consumer name resumes
//! where it stopped; entries left idle by another consumer for longer
//! than the visibility timeout are claimed with `XCLAIM`.
//!
//! An entry that does not decode as an envelope (for example one written
//! by a producer with a newer schema version) is published to the
//! topic's dead-letter stream with its raw bytes, then acknowledged.
//!
//! Leases and nack delays are tracked by the replica that holds the
//! entry. Ordering-key hold-back therefore applies to the entries a single
//! consumer holds; entries of one key are not spread across consumers
//! once claimed, but two replicas can each hold a different entry of the
//! same key after a failover.

use super::{
    dead_letter_topic, is_dead_letter_topic, Delivery, EnqueueAck, Receipt, Subscription,
    Transport, TransportStats,
};
use crate::config::validate_consumer_group;
use crate::dead_letter::DeadLetter;
use crate::envelope::EventEnvelope;
use crate::error::{PropagationError, PropagationResult};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ENVELOPE_FIELD: &str = "envelope";

fn unavailable(err: RedisError) -> PropagationError {
    PropagationError::TransportUnavailable(err.to_string())
}

/// Redis transport configuration.
#[derive(Debug, Clone)]
pub struct RedisTransportConfig {
    /// Key prefix for all Redis keys (e.g., `propagation`)
    pub key_prefix: String,
    /// Consumer name inside each group; defaults to the host name
    pub consumer_name: String,
    /// Time a delivery stays leased before it is handed out again
    pub visibility_timeout: Duration,
    /// Sleep between polls of an idle subscription
    pub poll_interval: Duration,
    /// Maximum entries a replica keeps pending at once
    pub batch_size: usize,
    /// Approximate stream length cap
    pub max_len: Option<usize>,
    /// Entries older than this are trimmed on enqueue
    pub max_age: Option<Duration>,
}

impl Default for RedisTransportConfig {
    fn default() -> Self {
        let consumer_name = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| format!("consumer-{}", std::process::id()));

        Self {
            key_prefix: "propagation".to_string(),
            consumer_name,
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            batch_size: 64,
            max_len: None,
            max_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    acknowledged: AtomicU64,
    expired: AtomicU64,
}

/// Local lease on a pending entry, keyed by `(topic, group, id)`.
type LeaseKey = (String, String, String);

struct Shared {
    conn: MultiplexedConnection,
    config: RedisTransportConfig,
    leases: DashMap<LeaseKey, Instant>,
    counters: Counters,
}

impl Shared {
    fn topics_key(&self) -> String {
        format!("{}:topics", self.config.key_prefix)
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:stream:{}", self.config.key_prefix, topic)
    }

    fn attempts_key(&self, topic: &str, group: &str) -> String {
        format!("{}:attempts:{}:{}", self.config.key_prefix, topic, group)
    }

    async fn require_topic(&self, topic: &str) -> PropagationResult<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .sismember(self.topics_key(), topic)
            .await
            .map_err(unavailable)?;
        if exists {
            Ok(())
        } else {
            Err(PropagationError::TopicNotFound(topic.to_string()))
        }
    }

    async fn trim(&self, stream_key: &str) -> PropagationResult<()> {
        let Some(max_age) = self.config.max_age else {
            return Ok(());
        };
        let cutoff_ms = chrono::Utc::now().timestamp_millis()
            - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        if cutoff_ms <= 0 {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let trimmed: u64 = redis::cmd("XTRIM")
            .arg(stream_key)
            .arg("MINID")
            .arg("~")
            .arg(format!("{}-0", cutoff_ms))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        self.counters.expired.fetch_add(trimmed, Ordering::Relaxed);
        Ok(())
    }

    /// `XADD` a validated envelope to its topic's stream.
    async fn append(&self, envelope: &EventEnvelope) -> PropagationResult<String> {
        self.require_topic(&envelope.topic).await?;

        let stream_key = self.stream_key(&envelope.topic);
        let bytes = envelope.to_bytes()?;
        let fields = [(ENVELOPE_FIELD, bytes)];

        let mut conn = self.conn.clone();
        let id: String = match self.config.max_len {
            Some(max_len) => conn
                .xadd_maxlen(&stream_key, StreamMaxlen::Approx(max_len), "*", &fields)
                .await
                .map_err(unavailable)?,
            None => conn
                .xadd(&stream_key, "*", &fields)
                .await
                .map_err(unavailable)?,
        };

        self.trim(&stream_key).await?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Publish raw bytes that failed to decode to the dead-letter stream.
    async fn route_undecodable(
        &self,
        topic: &str,
        group: &str,
        id: &str,
        raw: Vec<u8>,
        error: &PropagationError,
    ) -> PropagationResult<()> {
        if is_dead_letter_topic(topic) {
            tracing::error!(
                topic = %topic,
                consumer_group = %group,
                stream_id = %id,
                error = %error,
                "Dropping undecodable dead-letter entry"
            );
            return Ok(());
        }

        let record = DeadLetter::undecodable(topic, id, raw, group, error);
        let position = self.append(&record.to_envelope()?).await?;
        tracing::error!(
            topic = %topic,
            consumer_group = %group,
            stream_id = %id,
            dead_letter_position = %position,
            error = %error,
            "Undecodable stream entry dead-lettered"
        );
        Ok(())
    }

    /// Take over entries another consumer left idle past the visibility timeout.
    async fn reclaim_stale(&self, topic: &str, group: &str) -> PropagationResult<()> {
        let mut conn = self.conn.clone();
        let stream_key = self.stream_key(topic);
        let min_idle = self.config.visibility_timeout.as_millis() as usize;

        let pending: StreamPendingCountReply = conn
            .xpending_count(&stream_key, group, "-", "+", self.config.batch_size)
            .await
            .map_err(unavailable)?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.consumer != self.config.consumer_name && p.last_delivered_ms >= min_idle)
            .map(|p| p.id)
            .collect();

        if !stale.is_empty() {
            let claimed: StreamClaimReply = conn
                .xclaim(&stream_key, group, &self.config.consumer_name, min_idle, &stale)
                .await
                .map_err(unavailable)?;
            tracing::info!(
                topic = %topic,
                consumer_group = %group,
                claimed = claimed.ids.len(),
                "Claimed idle entries from another consumer"
            );
        }
        Ok(())
    }

    /// This consumer's pending entries, topped up with new entries.
    async fn read_entries(&self, topic: &str, group: &str) -> PropagationResult<Vec<StreamId>> {
        let mut conn = self.conn.clone();
        let stream_key = self.stream_key(topic);
        let consumer = self.config.consumer_name.as_str();

        let pending: Option<StreamReadReply> = conn
            .xread_options(
                &[&stream_key],
                &["0"],
                &StreamReadOptions::default()
                    .group(group, consumer)
                    .count(self.config.batch_size),
            )
            .await
            .map_err(unavailable)?;
        let mut entries: Vec<StreamId> = pending
            .map(|reply| reply.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();

        let room = self.config.batch_size.saturating_sub(entries.len());
        if room > 0 {
            let fresh: Option<StreamReadReply> = conn
                .xread_options(
                    &[&stream_key],
                    &[">"],
                    &StreamReadOptions::default().group(group, consumer).count(room),
                )
                .await
                .map_err(unavailable)?;
            if let Some(reply) = fresh {
                entries.extend(reply.keys.into_iter().flat_map(|k| k.ids));
            }
        }

        Ok(entries)
    }

    async fn settle(&self, topic: &str, group: &str, id: &str) -> PropagationResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(self.stream_key(topic), group, &[id])
            .await
            .map_err(unavailable)?;
        let _: i64 = conn
            .hdel(self.attempts_key(topic, group), id)
            .await
            .map_err(unavailable)?;
        self.leases
            .remove(&(topic.to_string(), group.to_string(), id.to_string()));
        Ok(())
    }

    async fn poll(&self, topic: &str, group: &str) -> PropagationResult<Option<Delivery>> {
        self.reclaim_stale(topic, group).await?;
        let entries = self.read_entries(topic, group).await?;

        let now = Instant::now();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            let Some(raw) = entry.get::<Vec<u8>>(ENVELOPE_FIELD) else {
                // trimmed while pending
                self.settle(topic, group, &entry.id).await?;
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let envelope = match EventEnvelope::from_bytes(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.route_undecodable(topic, group, &entry.id, raw, &e).await?;
                    self.settle(topic, group, &entry.id).await?;
                    continue;
                }
            };

            if let Some(key) = envelope.ordering_key.as_deref() {
                if blocked.contains(key) {
                    continue;
                }
            }

            let lease_key = (topic.to_string(), group.to_string(), entry.id.clone());
            let leased = self
                .leases
                .get(&lease_key)
                .map(|until| *until > now)
                .unwrap_or(false);
            if leased {
                if let Some(key) = envelope.ordering_key {
                    blocked.insert(key);
                }
                continue;
            }

            let mut conn = self.conn.clone();
            let attempt: u32 = conn
                .hincr(self.attempts_key(topic, group), &entry.id, 1)
                .await
                .map_err(unavailable)?;
            self.leases
                .insert(lease_key, now + self.config.visibility_timeout);

            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            if attempt > 1 {
                self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(
                envelope_id = %envelope.id,
                topic = %topic,
                consumer_group = %group,
                stream_id = %entry.id,
                attempt,
                "Envelope handed out"
            );

            return Ok(Some(Delivery {
                envelope: envelope.delivered(attempt),
                receipt: Receipt {
                    topic: topic.to_string(),
                    consumer_group: group.to_string(),
                    position: entry.id,
                },
            }));
        }

        Ok(None)
    }
}

/// Redis Streams transport.
///
/// Cloning is cheap; clones share the connection and local leases.
///
/// # Example
///
/// ```rust,no_run
/// use event_propagation::transport::redis::{RedisTransport, RedisTransportConfig};
/// use event_propagation::transport::Transport;
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let transport =
///         RedisTransport::connect("redis://localhost:6379", RedisTransportConfig::default()).await?;
///     transport.create_topic("order-events").await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RedisTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("config", &self.shared.config)
            .finish()
    }
}

impl RedisTransport {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., `redis://localhost:6379`)
    /// * `config` - Transport configuration
    pub async fn connect(redis_url: &str, config: RedisTransportConfig) -> PropagationResult<Self> {
        let client = Client::open(redis_url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        tracing::info!(
            prefix = %config.key_prefix,
            consumer = %config.consumer_name,
            "Connected Redis transport"
        );
        Ok(Self::from_connection(conn, config))
    }

    /// Build from an existing connection.
    pub fn from_connection(conn: MultiplexedConnection, config: RedisTransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                conn,
                config,
                leases: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Consumer name used inside each group.
    pub fn consumer_name(&self) -> &str {
        &self.shared.config.consumer_name
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn create_topic(&self, topic: &str) -> PropagationResult<()> {
        if topic.trim().is_empty() {
            return Err(PropagationError::TopicNotFound(
                "topic cannot be empty".to_string(),
            ));
        }

        let mut topics = vec![topic.to_string()];
        if !is_dead_letter_topic(topic) {
            topics.push(dead_letter_topic(topic));
        }

        let mut conn = self.shared.conn.clone();
        let _: i64 = conn
            .sadd(self.shared.topics_key(), &topics)
            .await
            .map_err(unavailable)?;

        tracing::debug!(topic = %topic, "Topic declared");
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> PropagationResult<bool> {
        let mut conn = self.shared.conn.clone();
        conn.sismember(self.shared.topics_key(), topic)
            .await
            .map_err(unavailable)
    }

    async fn enqueue(&self, envelope: EventEnvelope) -> PropagationResult<EnqueueAck> {
        envelope.validate()?;
        let id = self.shared.append(&envelope).await?;

        Ok(EnqueueAck {
            envelope_id: envelope.id,
            topic: envelope.topic,
            position: id,
        })
    }

    async fn subscribe(&self, topic: &str, consumer_group: &str) -> PropagationResult<Subscription> {
        validate_consumer_group(consumer_group)
            .map_err(|e| PropagationError::ConsumerGroupMisconfigured(e.to_string()))?;
        self.shared.require_topic(topic).await?;

        let mut conn = self.shared.conn.clone();
        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(self.shared.stream_key(topic), consumer_group, "0")
            .await;
        match created {
            Ok(()) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(unavailable(e)),
        }

        let shared = self.shared.clone();
        let topic_name = topic.to_string();
        let group_name = consumer_group.to_string();

        let stream = async_stream::stream! {
            loop {
                match shared.poll(&topic_name, &group_name).await {
                    Ok(Some(delivery)) => yield Ok(delivery),
                    Ok(None) => tokio::time::sleep(shared.config.poll_interval).await,
                    Err(e) => {
                        yield Err(e);
                        tokio::time::sleep(shared.config.poll_interval).await;
                    }
                }
            }
        };

        tracing::info!(
            topic = %topic,
            consumer_group = %consumer_group,
            consumer = %self.shared.config.consumer_name,
            "Consumer group subscribed"
        );

        Ok(Subscription::new(topic, consumer_group, stream.boxed()))
    }

    async fn ack(&self, receipt: &Receipt) -> PropagationResult<()> {
        self.shared
            .settle(&receipt.topic, &receipt.consumer_group, &receipt.position)
            .await?;
        self.shared.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, redeliver_after: Duration) -> PropagationResult<()> {
        let key = (
            receipt.topic.clone(),
            receipt.consumer_group.clone(),
            receipt.position.clone(),
        );
        if !self.shared.leases.contains_key(&key) {
            return Err(PropagationError::InvalidReceipt(format!(
                "no delivery {} held for group '{}'",
                receipt.position, receipt.consumer_group
            )));
        }
        self.shared.leases.insert(key, Instant::now() + redeliver_after);
        Ok(())
    }

    async fn stats(&self) -> TransportStats {
        let c = &self.shared.counters;
        TransportStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use serde_json::json;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    async fn transport() -> RedisTransport {
        let config = RedisTransportConfig {
            key_prefix: format!("propagation-test-{}", uuid::Uuid::now_v7()),
            visibility_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        RedisTransport::connect(&redis_url(), config)
            .await
            .expect("redis available")
    }

    fn envelope(key: &str, n: u32) -> EventEnvelope {
        EventEnvelope::new(
            "order-events",
            Payload::json("order.created", &json!({ "n": n })).unwrap(),
        )
        .with_ordering_key(key)
    }

    async fn recv(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timeout")
            .expect("delivery")
    }

    #[test]
    fn test_default_config() {
        let config = RedisTransportConfig::default();
        assert_eq!(config.key_prefix, "propagation");
        assert!(!config.consumer_name.is_empty());
        assert_eq!(config.batch_size, 64);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_enqueue_requires_declared_topic() {
        let transport = transport().await;
        let err = transport.enqueue(envelope("o-1", 1)).await.unwrap_err();
        assert!(matches!(err, PropagationError::TopicNotFound(_)));

        transport.create_topic("order-events").await.unwrap();
        assert!(transport.topic_exists("order-events.dead-letter").await.unwrap());
        transport.enqueue(envelope("o-1", 1)).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_key_order_and_redelivery() {
        let transport = transport().await;
        transport.create_topic("order-events").await.unwrap();
        transport.enqueue(envelope("o-1", 1)).await.unwrap();
        transport.enqueue(envelope("o-1", 2)).await.unwrap();

        let mut sub = transport.subscribe("order-events", "inventory").await.unwrap();
        let first = recv(&mut sub).await;
        assert_eq!(first.attempt(), 1);

        transport
            .nack(&first.receipt, Duration::from_millis(20))
            .await
            .unwrap();
        let again = recv(&mut sub).await;
        assert_eq!(again.envelope.id, first.envelope.id);
        assert_eq!(again.attempt(), 2);

        transport.ack(&again.receipt).await.unwrap();
        let second = recv(&mut sub).await;
        assert_eq!(second.envelope.payload.to_value().unwrap()["n"], 2);
        transport.ack(&second.receipt).await.unwrap();
        // acknowledging twice is harmless
        transport.ack(&second.receipt).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_newer_schema_entry_is_dead_lettered() {
        let transport = transport().await;
        transport.create_topic("order-events").await.unwrap();
        let shared = transport.shared.clone();
        let stream_key = shared.stream_key("order-events");

        let mut conn = shared.conn.clone();
        let _: () = conn
            .xgroup_create_mkstream(&stream_key, "inventory", "0")
            .await
            .unwrap();

        let mut value = serde_json::to_value(envelope("o-1", 1)).unwrap();
        value["schema_version"] = json!(2);
        let raw = serde_json::to_vec(&value).unwrap();
        let _: String = conn
            .xadd(&stream_key, "*", &[(ENVELOPE_FIELD, raw.clone())])
            .await
            .unwrap();

        assert!(shared.poll("order-events", "inventory").await.unwrap().is_none());
        assert!(shared.poll("order-events", "inventory").await.unwrap().is_none());

        let dead_letter_key = shared.stream_key(&dead_letter_topic("order-events"));
        let len: usize = conn.xlen(&dead_letter_key).await.unwrap();
        assert_eq!(len, 1);

        let pending: StreamPendingCountReply = conn
            .xpending_count(&stream_key, "inventory", "-", "+", 10)
            .await
            .unwrap();
        assert!(pending.ids.is_empty());

        let mut sub = transport
            .subscribe("order-events.dead-letter", "audit")
            .await
            .unwrap();
        let delivery = recv(&mut sub).await;
        let record = DeadLetter::from_envelope(&delivery.envelope).unwrap();
        assert_eq!(record.error_code, "SERIALIZATION_ERROR");
        assert_eq!(record.consumer_group, "inventory");
        assert_eq!(record.original.payload.data, raw);
    }
}
