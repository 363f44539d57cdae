//! In-memory transport for single-process deployments and tests.
//!
//! Each topic is an append-only log of envelopes with monotonically
//! increasing offsets. Each consumer group keeps its own acknowledgment
//! set, attempt counters and leases over that log, so groups never
//! interfere with each other.
//!
//! The log outlives subscriptions: dropping a subscription, or calling
//! [`MemoryTransport::restart`], keeps every unacknowledged envelope for
//! redelivery. Durability across an actual process exit needs a broker
//! backend such as the `redis` feature.

use super::{
    dead_letter_topic, is_dead_letter_topic, Delivery, EnqueueAck, Receipt, Subscription,
    Transport, TransportStats,
};
use crate::config::validate_consumer_group;
use crate::envelope::EventEnvelope;
use crate::error::{PropagationError, PropagationResult};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

/// When the transport may drop envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Drop envelopes older than this
    pub max_age: Option<Duration>,
    /// Keep at most this many envelopes per topic
    pub max_entries: Option<usize>,
    /// Drop envelopes once every known consumer group has acknowledged them
    pub drop_when_acknowledged: bool,
}

impl RetentionPolicy {
    /// Keep envelopes for a fixed time window.
    pub fn time(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
            ..Default::default()
        }
    }

    /// Keep at most `max_entries` envelopes per topic.
    pub fn size(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Default::default()
        }
    }

    /// Keep envelopes until all consumer groups acknowledged them.
    pub fn until_acknowledged() -> Self {
        Self {
            drop_when_acknowledged: true,
            ..Default::default()
        }
    }
}

/// In-memory transport configuration.
#[derive(Debug, Clone)]
pub struct MemoryTransportConfig {
    /// Time a delivery stays leased before it is handed out again
    pub visibility_timeout: Duration,
    /// Upper bound on how long an idle subscription sleeps between polls
    pub poll_interval: Duration,
    /// Retention policy
    pub retention: RetentionPolicy,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(20),
            retention: RetentionPolicy::default(),
        }
    }
}

struct Entry {
    offset: u64,
    envelope: EventEnvelope,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy)]
enum Lease {
    /// Handed out and awaiting ack
    InFlight { until: Instant },
    /// Nacked and waiting to be handed out again
    Delayed { until: Instant },
}

impl Lease {
    fn until(&self) -> Instant {
        match self {
            Lease::InFlight { until } | Lease::Delayed { until } => *until,
        }
    }
}

#[derive(Default)]
struct GroupState {
    /// Every offset below this is acknowledged or dropped
    low_watermark: u64,
    /// Acknowledged offsets at or above the watermark
    acked: BTreeSet<u64>,
    attempts: HashMap<u64, u32>,
    leases: HashMap<u64, Lease>,
}

impl GroupState {
    fn is_acked(&self, offset: u64) -> bool {
        offset < self.low_watermark || self.acked.contains(&offset)
    }

    fn advance_watermark(&mut self) {
        while self.acked.remove(&self.low_watermark) {
            self.low_watermark += 1;
        }
    }

    fn forget(&mut self, offset: u64) {
        self.acked.remove(&offset);
        self.attempts.remove(&offset);
        self.leases.remove(&offset);
        if self.low_watermark <= offset {
            self.low_watermark = offset + 1;
        }
        self.advance_watermark();
    }
}

#[derive(Default)]
struct TopicLog {
    entries: VecDeque<Entry>,
    next_offset: u64,
    groups: HashMap<String, GroupState>,
}

impl TopicLog {
    fn first_offset(&self) -> u64 {
        self.entries
            .front()
            .map(|e| e.offset)
            .unwrap_or(self.next_offset)
    }

    /// Hand out the earliest deliverable envelope for `group`.
    ///
    /// An unacknowledged envelope with a live lease blocks every later
    /// envelope sharing its ordering key.
    fn poll(&mut self, topic: &str, group: &str, now: Instant, visibility: Duration) -> Option<(Delivery, bool)> {
        let first_offset = self.first_offset();
        let TopicLog { entries, groups, .. } = self;
        let state = groups.entry(group.to_string()).or_insert_with(|| GroupState {
            low_watermark: first_offset,
            ..Default::default()
        });

        let mut blocked: HashSet<&str> = HashSet::new();
        // offsets are contiguous from `first_offset`
        let start = usize::try_from(state.low_watermark.saturating_sub(first_offset))
            .unwrap_or(usize::MAX)
            .min(entries.len());

        for entry in entries.range(start..) {
            if state.is_acked(entry.offset) {
                continue;
            }
            let key = entry.envelope.ordering_key.as_deref();
            if let Some(key) = key {
                if blocked.contains(key) {
                    continue;
                }
            }
            if let Some(lease) = state.leases.get(&entry.offset) {
                if lease.until() > now {
                    if let Some(key) = key {
                        blocked.insert(key);
                    }
                    continue;
                }
            }

            let attempt = state.attempts.entry(entry.offset).or_insert(0);
            *attempt += 1;
            let attempt = *attempt;
            state.leases.insert(
                entry.offset,
                Lease::InFlight {
                    until: now + visibility,
                },
            );

            let delivery = Delivery {
                envelope: entry.envelope.delivered(attempt),
                receipt: Receipt {
                    topic: topic.to_string(),
                    consumer_group: group.to_string(),
                    position: entry.offset.to_string(),
                },
            };
            return Some((delivery, attempt > 1));
        }

        None
    }

    /// Drop entries from the front of the log that retention no longer covers.
    fn enforce_retention(&mut self, retention: &RetentionPolicy, now: Instant) -> u64 {
        let mut dropped = 0;

        while let Some(front) = self.entries.front() {
            let too_old = retention
                .max_age
                .map(|age| now.saturating_duration_since(front.enqueued_at) >= age)
                .unwrap_or(false);
            let too_many = retention
                .max_entries
                .map(|max| self.entries.len() > max)
                .unwrap_or(false);
            let fully_acked = retention.drop_when_acknowledged
                && !self.groups.is_empty()
                && self.groups.values().all(|g| g.is_acked(front.offset));

            if !(too_old || too_many || fully_acked) {
                break;
            }

            let offset = front.offset;
            self.entries.pop_front();
            for group in self.groups.values_mut() {
                group.forget(offset);
            }
            dropped += 1;
        }

        dropped
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    acknowledged: AtomicU64,
    expired: AtomicU64,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    available: AtomicBool,
    config: MemoryTransportConfig,
    counters: Counters,
}

impl Shared {
    async fn poll(&self, topic: &str, group: &str) -> PropagationResult<Option<Delivery>> {
        if !self.available.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| PropagationError::TopicNotFound(topic.to_string()))?;

        let now = Instant::now();
        let expired = log.enforce_retention(&self.config.retention, now);
        self.counters.expired.fetch_add(expired, Ordering::Relaxed);

        match log.poll(topic, group, now, self.config.visibility_timeout) {
            Some((delivery, redelivered)) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                if redelivered {
                    self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!(
                    envelope_id = %delivery.envelope.id,
                    topic = %topic,
                    consumer_group = %group,
                    attempt = delivery.envelope.attempt,
                    "Envelope handed out"
                );
                Ok(Some(delivery))
            }
            None => Ok(None),
        }
    }

    fn check_available(&self) -> PropagationResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PropagationError::TransportUnavailable(
                "in-memory transport is marked unavailable".to_string(),
            ))
        }
    }
}

/// In-memory transport implementation.
///
/// Cloning is cheap; clones share the same logs.
///
/// # Example
///
/// ```rust
/// use event_propagation::envelope::{EventEnvelope, Payload};
/// use event_propagation::transport::memory::MemoryTransport;
/// use event_propagation::transport::Transport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = MemoryTransport::new();
/// transport.create_topic("order-events").await?;
///
/// let payload = Payload::json("order.created", &serde_json::json!({"order_id": "42"}))?;
/// transport.enqueue(EventEnvelope::new("order-events", payload)).await?;
///
/// let mut sub = transport.subscribe("order-events", "inventory").await?;
/// let delivery = sub.recv().await?;
/// transport.ack(&delivery.receipt).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("config", &self.shared.config)
            .field("available", &self.shared.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an in-memory transport with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryTransportConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(config: MemoryTransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                available: AtomicBool::new(true),
                config,
                counters: Counters::default(),
            }),
        }
    }

    /// Mark the transport reachable or unreachable.
    ///
    /// While unavailable, `enqueue`, `ack` and `nack` fail with
    /// `TransportUnavailable` and subscriptions receive nothing.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
        if available {
            self.shared.notify.notify_waiters();
        }
    }

    /// Simulate a transport restart.
    ///
    /// Leases are lost, so every unacknowledged envelope becomes
    /// deliverable again. Logs, acknowledgments and attempt counters survive.
    pub async fn restart(&self) {
        let mut state = self.shared.state.lock().await;
        for log in state.topics.values_mut() {
            for group in log.groups.values_mut() {
                group.leases.clear();
            }
        }
        drop(state);
        tracing::info!("In-memory transport restarted, leases dropped");
        self.shared.notify.notify_waiters();
    }

    /// Forget a group's acknowledgments on a topic.
    ///
    /// Every retained envelope is delivered to the group again, the way a
    /// broker replays after losing a consumer's committed position. Attempt
    /// counts of acknowledged envelopes start over at 1.
    pub async fn rewind(&self, topic: &str, consumer_group: &str) -> PropagationResult<()> {
        let mut state = self.shared.state.lock().await;
        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| PropagationError::TopicNotFound(topic.to_string()))?;
        let first_offset = log.first_offset();

        if let Some(group) = log.groups.get_mut(consumer_group) {
            group.low_watermark = first_offset;
            group.acked.clear();
            group.leases.clear();
        }
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Envelopes currently retained on a topic, in publish order.
    pub async fn retained(&self, topic: &str) -> PropagationResult<Vec<EventEnvelope>> {
        let state = self.shared.state.lock().await;
        let log = state
            .topics
            .get(topic)
            .ok_or_else(|| PropagationError::TopicNotFound(topic.to_string()))?;
        Ok(log.entries.iter().map(|e| e.envelope.clone()).collect())
    }

    /// Number of retained envelopes the group has not acknowledged.
    pub async fn unacknowledged(&self, topic: &str, consumer_group: &str) -> PropagationResult<usize> {
        let state = self.shared.state.lock().await;
        let log = state
            .topics
            .get(topic)
            .ok_or_else(|| PropagationError::TopicNotFound(topic.to_string()))?;

        Ok(match log.groups.get(consumer_group) {
            Some(group) => log
                .entries
                .iter()
                .filter(|e| !group.is_acked(e.offset))
                .count(),
            None => log.entries.len(),
        })
    }

    /// Apply the retention policy to every topic now.
    pub async fn enforce_retention(&self) -> u64 {
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        let dropped: u64 = state
            .topics
            .values_mut()
            .map(|log| log.enforce_retention(&self.shared.config.retention, now))
            .sum();
        self.shared.counters.expired.fetch_add(dropped, Ordering::Relaxed);
        dropped
    }

    fn parse_position(receipt: &Receipt) -> PropagationResult<u64> {
        receipt
            .position
            .parse()
            .map_err(|_| PropagationError::InvalidReceipt(receipt.position.clone()))
    }

    async fn with_group<F>(&self, receipt: &Receipt, f: F) -> PropagationResult<()>
    where
        F: FnOnce(&mut GroupState, u64),
    {
        self.shared.check_available()?;
        let offset = Self::parse_position(receipt)?;

        let mut state = self.shared.state.lock().await;
        let log = state
            .topics
            .get_mut(&receipt.topic)
            .ok_or_else(|| PropagationError::TopicNotFound(receipt.topic.clone()))?;
        if offset >= log.next_offset {
            return Err(PropagationError::InvalidReceipt(receipt.position.clone()));
        }
        let group = log.groups.get_mut(&receipt.consumer_group).ok_or_else(|| {
            PropagationError::InvalidReceipt(format!(
                "unknown consumer group '{}'",
                receipt.consumer_group
            ))
        })?;

        if !group.is_acked(offset) {
            f(group, offset);
        }

        let expired = log.enforce_retention(&self.shared.config.retention, Instant::now());
        self.shared.counters.expired.fetch_add(expired, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_topic(&self, topic: &str) -> PropagationResult<()> {
        if topic.trim().is_empty() {
            return Err(PropagationError::TopicNotFound(
                "topic cannot be empty".to_string(),
            ));
        }

        let mut state = self.shared.state.lock().await;
        state.topics.entry(topic.to_string()).or_default();
        if !is_dead_letter_topic(topic) {
            state.topics.entry(dead_letter_topic(topic)).or_default();
        }

        tracing::debug!(topic = %topic, "Topic declared");
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> PropagationResult<bool> {
        Ok(self.shared.state.lock().await.topics.contains_key(topic))
    }

    async fn enqueue(&self, envelope: EventEnvelope) -> PropagationResult<EnqueueAck> {
        self.shared.check_available()?;
        envelope.validate()?;

        let mut state = self.shared.state.lock().await;
        let log = state
            .topics
            .get_mut(&envelope.topic)
            .ok_or_else(|| PropagationError::TopicNotFound(envelope.topic.clone()))?;

        let offset = log.next_offset;
        log.next_offset += 1;

        let ack = EnqueueAck {
            envelope_id: envelope.id,
            topic: envelope.topic.clone(),
            position: offset.to_string(),
        };
        log.entries.push_back(Entry {
            offset,
            envelope,
            enqueued_at: Instant::now(),
        });

        let expired = log.enforce_retention(&self.shared.config.retention, Instant::now());
        drop(state);

        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.counters.expired.fetch_add(expired, Ordering::Relaxed);
        self.shared.notify.notify_waiters();

        Ok(ack)
    }

    async fn subscribe(&self, topic: &str, consumer_group: &str) -> PropagationResult<Subscription> {
        validate_consumer_group(consumer_group)
            .map_err(|e| PropagationError::ConsumerGroupMisconfigured(e.to_string()))?;

        {
            let mut state = self.shared.state.lock().await;
            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| PropagationError::TopicNotFound(topic.to_string()))?;
            let first_offset = log.first_offset();
            log.groups
                .entry(consumer_group.to_string())
                .or_insert_with(|| GroupState {
                    low_watermark: first_offset,
                    ..Default::default()
                });
        }

        let shared = self.shared.clone();
        let topic_name = topic.to_string();
        let group_name = consumer_group.to_string();

        let stream = async_stream::stream! {
            loop {
                let notified = shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match shared.poll(&topic_name, &group_name).await {
                    Ok(Some(delivery)) => yield Ok(delivery),
                    Ok(None) => {
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = tokio::time::sleep(shared.config.poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        tokio::time::sleep(shared.config.poll_interval).await;
                    }
                }
            }
        };

        tracing::info!(topic = %topic, consumer_group = %consumer_group, "Consumer group subscribed");

        Ok(Subscription::new(topic, consumer_group, stream.boxed()))
    }

    async fn ack(&self, receipt: &Receipt) -> PropagationResult<()> {
        self.with_group(receipt, |group, offset| {
            group.leases.remove(&offset);
            group.attempts.remove(&offset);
            group.acked.insert(offset);
            group.advance_watermark();
        })
        .await?;

        self.shared.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, redeliver_after: Duration) -> PropagationResult<()> {
        let until = Instant::now() + redeliver_after;
        self.with_group(receipt, |group, offset| {
            group.leases.insert(offset, Lease::Delayed { until });
        })
        .await?;

        self.shared.notify.notify_waiters();
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
