//! Event envelope and payload types
//!
//! This module defines the wire representation of a published domain
//! event. The envelope is created once by the publisher and never mutated
//! afterwards; the only per-delivery field, `attempt`, is stamped on the
//! copy a transport hands to a consumer.
//!
//! ## Wire format
//!
//! Envelopes are encoded as JSON. `payload.data` is base64 so that the
//! payload stays opaque to the transport. `schema_version` is bumped
//! whenever the envelope layout changes; consumers reject versions newer
//! than [`SCHEMA_VERSION`].

use crate::error::{PropagationError, PropagationResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Globally unique envelope identifier, assigned at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Generate a new time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EnvelopeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// UTF-8 JSON document
    Json,
    /// Bytes the core never decodes
    Binary,
}

/// Serialized domain event plus the tag used to decode it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Event type tag (e.g., "order.created")
    pub type_tag: String,

    /// Encoding of `data`
    pub content_type: ContentType,

    /// Serialized event bytes
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Payload {
    /// Serialize a value as a JSON payload.
    pub fn json<T: Serialize + ?Sized>(type_tag: impl Into<String>, value: &T) -> PropagationResult<Self> {
        Ok(Self {
            type_tag: type_tag.into(),
            content_type: ContentType::Json,
            data: serde_json::to_vec(value)?,
        })
    }

    /// Wrap raw bytes.
    pub fn binary(type_tag: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            content_type: ContentType::Binary,
            data,
        }
    }

    /// Decode a JSON payload into a generic value.
    ///
    /// Binary payloads are exposed as a JSON array of bytes.
    pub fn to_value(&self) -> PropagationResult<serde_json::Value> {
        match self.content_type {
            ContentType::Json => Ok(serde_json::from_slice(&self.data)?),
            ContentType::Binary => Ok(serde_json::Value::from(self.data.clone())),
        }
    }

    /// Decode a JSON payload into a specific type.
    pub fn decode<T: DeserializeOwned>(&self) -> PropagationResult<T> {
        match self.content_type {
            ContentType::Json => Ok(serde_json::from_slice(&self.data)?),
            ContentType::Binary => Err(PropagationError::SerializationError(format!(
                "payload '{}' is binary and cannot be decoded as JSON",
                self.type_tag
            ))),
        }
    }
}

/// A domain event the publisher can wrap in an envelope.
///
/// The core only looks at the type tag; the event body is opaque.
pub trait DomainEvent: Serialize {
    /// Type tag used by consumers to pick a decoder (e.g., "order.created").
    fn event_type(&self) -> &str;

    /// Serialize into a JSON payload.
    fn to_payload(&self) -> PropagationResult<Payload> {
        Payload::json(self.event_type(), self)
    }
}

/// Durable unit of transport: a domain event plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique envelope ID
    pub id: EnvelopeId,

    /// Envelope layout version
    pub schema_version: u32,

    /// Logical channel (e.g., "order-events")
    pub topic: String,

    /// Envelopes sharing a key are delivered in publish order per consumer group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,

    /// Caller-supplied dedup key; replaces `id` for idempotency checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Serialized domain event
    pub payload: Payload,

    /// Time the publisher created the envelope
    pub published_at: DateTime<Utc>,

    /// Delivery attempt for the receiving consumer group (1-based)
    pub attempt: u32,

    /// Publishing service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Correlation ID for tracing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl EventEnvelope {
    /// Create a new envelope.
    ///
    /// # Arguments
    ///
    /// * `topic` - The topic to publish to
    /// * `payload` - The serialized event
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: EnvelopeId::new(),
            schema_version: SCHEMA_VERSION,
            topic: topic.into(),
            ordering_key: None,
            idempotency_key: None,
            payload,
            published_at: Utc::now(),
            attempt: 1,
            source: None,
            correlation_id: None,
            headers: BTreeMap::new(),
        }
    }

    /// Wrap a domain event.
    pub fn for_event<E: DomainEvent + ?Sized>(topic: impl Into<String>, event: &E) -> PropagationResult<Self> {
        Ok(Self::new(topic, event.to_payload()?))
    }

    /// Set the ordering key.
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// Set a caller-generated idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the publishing service.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Copy of this envelope as handed out on delivery `attempt`.
    pub fn delivered(&self, attempt: u32) -> Self {
        Self {
            attempt: attempt.max(1),
            ..self.clone()
        }
    }

    /// Key used by idempotency stores.
    pub fn dedup_key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Check the fields a transport relies on.
    pub fn validate(&self) -> PropagationResult<()> {
        if self.topic.trim().is_empty() {
            return Err(PropagationError::TopicNotFound(
                "topic cannot be empty".to_string(),
            ));
        }
        if self.schema_version == 0 || self.schema_version > SCHEMA_VERSION {
            return Err(PropagationError::SerializationError(format!(
                "unsupported envelope schema version {} (supported: {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        if self.payload.type_tag.is_empty() {
            return Err(PropagationError::SerializationError(
                "payload type tag cannot be empty".to_string(),
            ));
        }
        if matches!(self.idempotency_key.as_deref(), Some("")) {
            return Err(PropagationError::SerializationError(
                "idempotency key cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Encode for the wire.
    pub fn to_bytes(&self) -> PropagationResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the wire and validate.
    pub fn from_bytes(bytes: &[u8]) -> PropagationResult<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
