//! Error types for event propagation
//!
//! This module defines the failure taxonomy shared by the publisher,
//! transports, dispatcher and idempotency stores.

use crate::config::ConfigError;
use thiserror::Error;

/// Event propagation error types.
///
/// Errors are split into transient transport failures (retryable),
/// configuration failures (fatal at startup), and per-message failures
/// (handler and payload errors) that end in a retry or a dead letter.
#[derive(Debug, Error)]
pub enum PropagationError {
    /// The transport could not durably accept or deliver an envelope
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The topic was never declared on the transport
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Consumer group registration is invalid
    #[error("Consumer group misconfigured: {0}")]
    ConsumerGroupMisconfigured(String),

    /// A registered handler reported a domain failure
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    /// An envelope or payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The idempotency store failed
    #[error("Idempotency store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A delivery receipt did not belong to this transport
    #[error("Invalid delivery receipt: {0}")]
    InvalidReceipt(String),

    /// Subscription channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for event propagation operations.
pub type PropagationResult<T> = Result<T, PropagationError>;

impl PropagationError {
    /// Check whether retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PropagationError::TransportUnavailable(_)
                | PropagationError::HandlerFailure(_)
                | PropagationError::Store(StoreError::Unavailable(_))
        )
    }

    /// Check whether this error is a misconfiguration that must stop startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PropagationError::TopicNotFound(_)
                | PropagationError::ConsumerGroupMisconfigured(_)
                | PropagationError::Config(_)
        )
    }

    /// Get a stable error code for logs and reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            PropagationError::TransportUnavailable(_) => "TRANSPORT_UNAVAILABLE",
            PropagationError::TopicNotFound(_) => "TOPIC_NOT_FOUND",
            PropagationError::ConsumerGroupMisconfigured(_) => "CONSUMER_GROUP_MISCONFIGURED",
            PropagationError::HandlerFailure(_) => "HANDLER_FAILURE",
            PropagationError::SerializationError(_) => "SERIALIZATION_ERROR",
            PropagationError::Store(_) => "STORE_ERROR",
            PropagationError::Config(_) => "CONFIG_ERROR",
            PropagationError::InvalidReceipt(_) => "INVALID_RECEIPT",
            PropagationError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}

impl From<serde_json::Error> for PropagationError {
    fn from(err: serde_json::Error) -> Self {
        PropagationError::SerializationError(err.to_string())
    }
}

/// Idempotency store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded
    #[error("corrupt record for {key}: {message}")]
    Corrupt {
        /// Record key
        key: String,
        /// Decode error
        message: String,
    },
}

/// Result type for idempotency store operations.
pub type StoreResult<T> = Result<T, StoreError>;
