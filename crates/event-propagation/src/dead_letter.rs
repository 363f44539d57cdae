//! Dead-letter records.
//!
//! An envelope that exhausts its attempts, or that cannot be decoded, is
//! wrapped in a [`DeadLetter`] and published to `"{topic}.dead-letter"`.

use crate::envelope::{EventEnvelope, Payload};
use crate::error::{PropagationError, PropagationResult};
use crate::transport::dead_letter_topic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type tag of dead-letter payloads.
pub const DEAD_LETTER_TYPE: &str = "dead_letter";

/// Type tag of the stand-in original for bytes that did not decode as an envelope.
pub const UNDECODABLE_TYPE: &str = "undecodable_envelope";

/// Envelope that a consumer group gave up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Envelope as last delivered
    pub original: EventEnvelope,
    /// Group that gave up
    pub consumer_group: String,
    /// Last failure
    pub reason: String,
    /// Stable code of the last failure
    pub error_code: String,
    /// Handler attempts made
    pub attempts: u32,
    /// Time of routing
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Build a record for the last failure of `original`.
    pub fn new(
        original: EventEnvelope,
        consumer_group: impl Into<String>,
        error: &PropagationError,
        attempts: u32,
    ) -> Self {
        Self {
            original,
            consumer_group: consumer_group.into(),
            reason: error.to_string(),
            error_code: error.error_code().to_string(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Build a record for broker bytes that are not a readable envelope.
    ///
    /// The raw bytes travel as a binary payload of a stand-in envelope on
    /// `topic`, keyed by the broker `position` so that routing the same
    /// entry twice yields one logical entry.
    pub fn undecodable(
        topic: &str,
        position: &str,
        raw: Vec<u8>,
        consumer_group: impl Into<String>,
        error: &PropagationError,
    ) -> Self {
        let original = EventEnvelope::new(topic, Payload::binary(UNDECODABLE_TYPE, raw))
            .with_idempotency_key(format!("{}@{}", topic, position))
            .delivered(1);
        Self::new(original, consumer_group, error, 1)
    }

    /// Wrap the record in an envelope for the dead-letter topic.
    ///
    /// The ordering key and correlation ID of the original are kept. The
    /// idempotency key is derived from the group and the original dedup
    /// key, so routing the same envelope twice yields one logical entry.
    pub fn to_envelope(&self) -> PropagationResult<EventEnvelope> {
        let payload = Payload::json(DEAD_LETTER_TYPE, self)?;
        let mut envelope = EventEnvelope::new(dead_letter_topic(&self.original.topic), payload)
            .with_idempotency_key(format!(
                "{}:{}",
                self.consumer_group,
                self.original.dedup_key()
            ))
            .with_header("consumer_group", self.consumer_group.clone())
            .with_header("error_code", self.error_code.clone());

        envelope.ordering_key = self.original.ordering_key.clone();
        envelope.correlation_id = self.original.correlation_id.clone();
        envelope.source = self.original.source.clone();
        Ok(envelope)
    }

    /// Read a record back from a dead-letter envelope.
    pub fn from_envelope(envelope: &EventEnvelope) -> PropagationResult<Self> {
        if envelope.payload.type_tag != DEAD_LETTER_TYPE {
            return Err(PropagationError::SerializationError(format!(
                "expected '{}' payload, got '{}'",
                DEAD_LETTER_TYPE, envelope.payload.type_tag
            )));
        }
        envelope.payload.decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn original() -> EventEnvelope {
        EventEnvelope::new(
            "order-events",
            Payload::json("order.created", &json!({"order_id": "order-42"})).unwrap(),
        )
        .with_ordering_key("order-42")
        .with_correlation_id("req-7")
        .delivered(3)
    }

    #[test]
    fn test_dead_letter_envelope_shape() {
        let err = PropagationError::HandlerFailure("out of stock".into());
        let record = DeadLetter::new(original(), "inventory", &err, 3);
        let envelope = record.to_envelope().unwrap();

        assert_eq!(envelope.topic, "order-events.dead-letter");
        assert_eq!(envelope.payload.type_tag, DEAD_LETTER_TYPE);
        assert_eq!(envelope.ordering_key.as_deref(), Some("order-42"));
        assert_eq!(envelope.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(
            envelope.headers.get("error_code").map(String::as_str),
            Some("HANDLER_FAILURE")
        );
        assert_eq!(
            envelope.idempotency_key,
            Some(format!("inventory:{}", record.original.id))
        );
        envelope.validate().unwrap();

        let back = DeadLetter::from_envelope(&envelope).unwrap();
        assert_eq!(back.attempts, 3);
        assert_eq!(back.original.attempt, 3);
        assert!(back.reason.contains("out of stock"));
    }

    #[test]
    fn test_undecodable_keeps_raw_bytes() {
        let raw = br#"{"schema_version":2}"#.to_vec();
        let err = PropagationError::SerializationError("unsupported envelope schema version 2".into());
        let record = DeadLetter::undecodable("order-events", "1700000000000-0", raw.clone(), "inventory", &err);

        let envelope = record.to_envelope().unwrap();
        assert_eq!(envelope.topic, "order-events.dead-letter");
        assert_eq!(
            envelope.idempotency_key.as_deref(),
            Some("inventory:order-events@1700000000000-0")
        );

        let back = DeadLetter::from_envelope(&envelope).unwrap();
        assert_eq!(back.error_code, "SERIALIZATION_ERROR");
        assert_eq!(back.original.payload.type_tag, UNDECODABLE_TYPE);
        assert_eq!(back.original.payload.data, raw);
    }

    #[test]
    fn test_from_envelope_rejects_other_types() {
        let err = DeadLetter::from_envelope(&original()).unwrap_err();
        assert!(matches!(err, PropagationError::SerializationError(_)));
    }
}
