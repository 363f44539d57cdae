//! Event handlers and their registration.
//!
//! Domain services hand the dispatcher one handler per `(topic,
//! consumer_group)`. Registration is explicit and resolved once at
//! startup through [`HandlerRegistry`].

use crate::config::validate_consumer_group;
use crate::envelope::{EnvelopeId, EventEnvelope};
use crate::error::{PropagationError, PropagationResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Handler failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Domain failure; the envelope is retried per the retry policy
    #[error("{0}")]
    Failed(String),

    /// The event cannot be understood; retrying will not help
    #[error("malformed event: {0}")]
    Malformed(String),
}

impl HandlerError {
    /// Domain failure.
    pub fn failed(message: impl fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }

    /// Undecodable event.
    pub fn malformed(message: impl fmt::Display) -> Self {
        HandlerError::Malformed(message.to_string())
    }
}

impl From<HandlerError> for PropagationError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Failed(message) => PropagationError::HandlerFailure(message),
            HandlerError::Malformed(message) => PropagationError::SerializationError(message),
        }
    }
}

/// A delivered event with its payload decoded.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    /// Envelope as delivered
    pub envelope: EventEnvelope,
    /// Consumer group the event was delivered to
    pub consumer_group: String,
    /// Decoded payload body
    pub body: serde_json::Value,
}

impl DecodedEvent {
    /// Envelope ID.
    pub fn id(&self) -> EnvelopeId {
        self.envelope.id
    }

    /// Payload type tag.
    pub fn event_type(&self) -> &str {
        &self.envelope.payload.type_tag
    }

    /// Delivery attempt.
    pub fn attempt(&self) -> u32 {
        self.envelope.attempt
    }

    /// Parse the body into a specific type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            HandlerError::malformed(format!(
                "cannot decode '{}' payload: {}",
                self.event_type(),
                e
            ))
        })
    }
}

/// Event handler trait for processing deliveries.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: DecodedEvent) -> Result<(), HandlerError>;
}

/// Handler wrapping an async closure.
///
/// # Example
///
/// ```rust
/// use event_propagation::handler::{FnHandler, HandlerRegistry};
/// use std::sync::Arc;
///
/// let mut registry = HandlerRegistry::new();
/// registry
///     .register(
///         "order-events",
///         "inventory",
///         Arc::new(FnHandler::new(|event| async move {
///             tracing::info!(event_type = %event.event_type(), "reserving stock");
///             Ok(())
///         })),
///     )
///     .unwrap();
/// ```
pub struct FnHandler<F> {
    handler: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(DecodedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    /// Create a new closure-based handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DecodedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: DecodedEvent) -> Result<(), HandlerError> {
        (self.handler)(event).await
    }
}

/// Handler that decodes the body into `E` before calling the closure.
///
/// A body that does not decode is reported as [`HandlerError::Malformed`]
/// and dead-lettered without retries. With [`TypedHandler::only`], events
/// whose type tag is not listed are acknowledged without being decoded.
pub struct TypedHandler<E, F> {
    handler: F,
    accepted: Option<HashSet<String>>,
    _event: PhantomData<fn() -> E>,
}

impl<E, F, Fut> TypedHandler<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(E, DecodedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    /// Create a typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            accepted: None,
            _event: PhantomData,
        }
    }

    /// Restrict the handler to the given type tags.
    pub fn only<I, S>(mut self, type_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted = Some(type_tags.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(E, DecodedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: DecodedEvent) -> Result<(), HandlerError> {
        if let Some(accepted) = &self.accepted {
            if !accepted.contains(event.event_type()) {
                tracing::debug!(
                    envelope_id = %event.id(),
                    event_type = %event.event_type(),
                    "Event type not handled, acknowledging"
                );
                return Ok(());
            }
        }

        let typed: E = event.parse()?;
        (self.handler)(typed, event).await
    }
}

/// Handlers keyed by `(topic, consumer_group)`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<(String, String), Arc<dyn EventHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registrations", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// # Errors
    ///
    /// * `TopicNotFound` - empty topic
    /// * `ConsumerGroupMisconfigured` - invalid group name, or a handler is
    ///   already registered for this `(topic, consumer_group)`
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        consumer_group: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> PropagationResult<()> {
        let topic = topic.into();
        let consumer_group = consumer_group.into();

        if topic.trim().is_empty() {
            return Err(PropagationError::TopicNotFound(
                "topic cannot be empty".to_string(),
            ));
        }
        validate_consumer_group(&consumer_group)
            .map_err(|e| PropagationError::ConsumerGroupMisconfigured(e.to_string()))?;

        let key = (topic, consumer_group);
        if self.handlers.contains_key(&key) {
            return Err(PropagationError::ConsumerGroupMisconfigured(format!(
                "handler already registered for topic '{}' and group '{}'",
                key.0, key.1
            )));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Look up the handler for a registration.
    pub fn get(&self, topic: &str, consumer_group: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .get(&(topic.to_string(), consumer_group.to_string()))
            .cloned()
    }

    /// All `(topic, consumer_group)` registrations.
    pub fn registrations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.handlers
            .keys()
            .map(|(topic, group)| (topic.as_str(), group.as_str()))
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
