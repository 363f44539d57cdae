//! Transport abstraction
//!
//! A transport durably stores enqueued envelopes and hands them out to
//! consumer groups with at-least-once semantics. Each consumer group has
//! its own position in a topic, so every group sees every envelope; replicas
//! inside one group compete for deliveries.
//!
//! ## Guarantees
//!
//! - For a fixed `(topic, ordering_key, consumer_group)` envelopes are
//!   delivered in publish order: a later envelope is held back until every
//!   earlier envelope with the same key has been acknowledged.
//! - Envelopes without an ordering key, or with different keys, carry no
//!   relative ordering.
//! - A delivery that is neither acknowledged nor nacked becomes visible
//!   again after the visibility timeout. Envelopes may therefore be
//!   delivered more than once, including after they were processed.
//!
//! ## Dead-letter topics
//!
//! Declaring a topic also declares `"{topic}.dead-letter"`
//! (see [`dead_letter_topic`]).

use crate::envelope::{EnvelopeId, EventEnvelope};
use crate::error::{PropagationError, PropagationResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::fmt;
use std::time::Duration;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Suffix appended to a topic name to form its dead-letter topic.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Name of the dead-letter topic paired with `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}{}", topic, DEAD_LETTER_SUFFIX)
}

/// Whether `topic` is itself a dead-letter topic.
pub fn is_dead_letter_topic(topic: &str) -> bool {
    topic.ends_with(DEAD_LETTER_SUFFIX)
}

/// Acknowledgment returned once an envelope is durably enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueAck {
    /// Enqueued envelope
    pub envelope_id: EnvelopeId,
    /// Topic it was appended to
    pub topic: String,
    /// Transport-specific log position
    pub position: String,
}

/// Handle identifying one delivery to one consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt {
    /// Topic of the delivered envelope
    pub topic: String,
    /// Consumer group the delivery belongs to
    pub consumer_group: String,
    /// Transport-specific log position
    pub position: String,
}

/// An envelope handed to a consumer group, with `attempt` stamped.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Envelope as delivered
    pub envelope: EventEnvelope,
    /// Handle for ack/nack
    pub receipt: Receipt,
}

impl Delivery {
    /// Delivery attempt for this consumer group.
    pub fn attempt(&self) -> u32 {
        self.envelope.attempt
    }
}

/// Lazy, infinite sequence of deliveries for one `(topic, consumer_group)`.
pub struct Subscription {
    /// Subscribed topic
    pub topic: String,
    /// Consumer group
    pub consumer_group: String,
    stream: BoxStream<'static, PropagationResult<Delivery>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("consumer_group", &self.consumer_group)
            .finish()
    }
}

impl Subscription {
    /// Wrap a delivery stream.
    pub fn new(
        topic: impl Into<String>,
        consumer_group: impl Into<String>,
        stream: BoxStream<'static, PropagationResult<Delivery>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            stream,
        }
    }

    /// Receive the next delivery.
    ///
    /// Suspends until an envelope is available. Returns
    /// [`PropagationError::ChannelClosed`] once the transport is gone.
    pub async fn recv(&mut self) -> PropagationResult<Delivery> {
        match self.stream.next().await {
            Some(result) => result,
            None => Err(PropagationError::ChannelClosed),
        }
    }

    /// Convert into the underlying stream.
    pub fn into_stream(self) -> BoxStream<'static, PropagationResult<Delivery>> {
        self.stream
    }
}

/// Transport statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Envelopes accepted by `enqueue`
    pub enqueued: u64,
    /// Deliveries handed out, redeliveries included
    pub delivered: u64,
    /// Deliveries with `attempt > 1`
    pub redelivered: u64,
    /// Acknowledgments accepted
    pub acknowledged: u64,
    /// Envelopes removed by retention
    pub expired: u64,
}

/// Broker abstraction used by publishers and dispatchers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare a topic and its dead-letter topic. Idempotent.
    async fn create_topic(&self, topic: &str) -> PropagationResult<()>;

    /// Check whether a topic was declared.
    async fn topic_exists(&self, topic: &str) -> PropagationResult<bool>;

    /// Durably append an envelope to its topic.
    ///
    /// # Errors
    ///
    /// * `TransportUnavailable` - transient, the caller may retry
    /// * `TopicNotFound` - the topic was never declared
    async fn enqueue(&self, envelope: EventEnvelope) -> PropagationResult<EnqueueAck>;

    /// Subscribe a consumer group to a topic.
    ///
    /// The stream resumes from the group's last acknowledged position;
    /// unacknowledged envelopes are handed out again.
    async fn subscribe(&self, topic: &str, consumer_group: &str) -> PropagationResult<Subscription>;

    /// Acknowledge a delivery. Acknowledging twice is not an error.
    async fn ack(&self, receipt: &Receipt) -> PropagationResult<()>;

    /// Give a delivery back, to be handed out again after `redeliver_after`.
    async fn nack(&self, receipt: &Receipt, redeliver_after: Duration) -> PropagationResult<()>;

    /// Get transport statistics.
    async fn stats(&self) -> TransportStats;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport")
    }
}
