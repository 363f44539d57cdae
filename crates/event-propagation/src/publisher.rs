//! Publisher
//!
//! Wraps domain events in envelopes and hands them to the transport.
//! Transient transport failures are retried in place until the publish
//! timeout runs out. A failed publish may still have enqueued the envelope
//! (at-least-once); callers that must not duplicate use
//! [`Publisher::publish_with_idempotency_key`] so consumers dedup on their
//! own key.

use crate::config::PropagationConfig;
use crate::envelope::{DomainEvent, EnvelopeId, EventEnvelope};
use crate::error::{PropagationError, PropagationResult};
use crate::retry::{with_retry_if, RetryPolicy};
use crate::transport::{EnqueueAck, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Upper bound on one publish call, retries included
    pub publish_timeout: Duration,
    /// In-place retries of transient transport failures
    pub retry: RetryPolicy,
    /// Stamped as `source` on every envelope
    pub source: Option<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            retry: RetryPolicy::fast(),
            source: None,
        }
    }
}

impl PublisherConfig {
    /// Settings derived from a runtime configuration.
    pub fn from_config(config: &PropagationConfig) -> Self {
        Self {
            publish_timeout: config.publish_timeout(),
            ..Default::default()
        }
    }

    /// Set the source stamped on envelopes.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Publisher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Envelopes accepted by the transport
    pub published: u64,
    /// Publish calls that returned an error
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
}

/// Event publisher.
///
/// Cloning is cheap; clones share the transport and statistics.
///
/// # Example
///
/// ```rust
/// use event_propagation::envelope::DomainEvent;
/// use event_propagation::publisher::Publisher;
/// use event_propagation::transport::memory::MemoryTransport;
/// use event_propagation::transport::Transport;
/// use serde::Serialize;
/// use std::sync::Arc;
///
/// #[derive(Serialize)]
/// struct OrderCreated {
///     order_id: String,
/// }
///
/// impl DomainEvent for OrderCreated {
///     fn event_type(&self) -> &str {
///         "order.created"
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(MemoryTransport::new());
/// transport.create_topic("order-events").await?;
///
/// let publisher = Publisher::new(transport);
/// let event = OrderCreated { order_id: "order-42".to_string() };
/// let _id = publisher.publish("order-events", Some("order-42"), &event).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    config: PublisherConfig,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .finish()
    }
}

impl Publisher {
    /// Create a publisher with default settings.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, PublisherConfig::default())
    }

    /// Create with custom settings.
    pub fn with_config(transport: Arc<dyn Transport>, config: PublisherConfig) -> Self {
        Self {
            transport,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Publish a domain event.
    ///
    /// # Errors
    ///
    /// * `TopicNotFound` - empty or undeclared topic
    /// * `SerializationError` - the event could not be serialized; nothing was enqueued
    /// * `TransportUnavailable` - not accepted within the publish timeout
    pub async fn publish<E>(&self, topic: &str, ordering_key: Option<&str>, event: &E) -> PropagationResult<EnvelopeId>
    where
        E: DomainEvent + ?Sized,
    {
        let envelope = self.build(topic, ordering_key, event)?;
        Ok(self.publish_envelope(envelope).await?.envelope_id)
    }

    /// Publish with a caller-generated idempotency key.
    ///
    /// Consumers dedup on `idempotency_key` instead of the envelope ID, so
    /// retrying a failed publish with the same key is handled once.
    pub async fn publish_with_idempotency_key<E>(
        &self,
        topic: &str,
        ordering_key: Option<&str>,
        idempotency_key: &str,
        event: &E,
    ) -> PropagationResult<EnvelopeId>
    where
        E: DomainEvent + ?Sized,
    {
        let envelope = self
            .build(topic, ordering_key, event)?
            .with_idempotency_key(idempotency_key);
        Ok(self.publish_envelope(envelope).await?.envelope_id)
    }

    /// Publish a pre-built envelope.
    pub async fn publish_envelope(&self, envelope: EventEnvelope) -> PropagationResult<EnqueueAck> {
        if let Err(e) = envelope.validate() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let envelope_id = envelope.id;
        let timeout = self.config.publish_timeout;
        let transport = &self.transport;

        let enqueue = with_retry_if(
            &self.config.retry,
            || transport.enqueue(envelope.clone()),
            PropagationError::is_retryable,
        );

        let result = match tokio::time::timeout(timeout, enqueue).await {
            Ok(result) => result,
            Err(_) => Err(PropagationError::TransportUnavailable(format!(
                "enqueue not acknowledged within {}ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(ack) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    envelope_id = %envelope_id,
                    topic = %ack.topic,
                    position = %ack.position,
                    "Envelope published"
                );
                Ok(ack)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    envelope_id = %envelope_id,
                    topic = %envelope.topic,
                    error = %e,
                    code = e.error_code(),
                    "Publish failed"
                );
                Err(e)
            }
        }
    }

    /// Get publisher statistics.
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn build<E>(&self, topic: &str, ordering_key: Option<&str>, event: &E) -> PropagationResult<EventEnvelope>
    where
        E: DomainEvent + ?Sized,
    {
        if topic.trim().is_empty() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return Err(PropagationError::TopicNotFound(
                "topic cannot be empty".to_string(),
            ));
        }

        let mut envelope = match EventEnvelope::for_event(topic, event) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        if let Some(key) = ordering_key {
            envelope = envelope.with_ordering_key(key);
        }
        if let Some(source) = &self.config.source {
            envelope = envelope.with_source(source.clone());
        }
        Ok(envelope)
    }
}
