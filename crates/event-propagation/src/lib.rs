//! # Event Propagation
//!
//! This crate provides an at-least-once event propagation core: domain
//! events are published through a broker abstraction, delivered to every
//! interested consumer group, deduplicated per group, retried on failure
//! and routed to a dead-letter topic when they cannot be processed.
//!
//! ## Overview
//!
//! The event-propagation crate handles:
//! - **Envelopes**: Versioned wire form of a domain event plus delivery metadata
//! - **Publisher**: Wraps events in envelopes and enqueues them
//! - **Transport**: Durable enqueue, per-group delivery, ordering keys, redelivery
//! - **Dispatcher**: Pulls deliveries and invokes handlers effectively once
//! - **Idempotency Store**: Records per-group processing outcomes
//! - **Retry Policy**: Redelivery delays and dead-letter routing
//!
//! ## Architecture
//!
//! ```text
//! domain logic ─► Publisher ─► Transport ─┬─► Dispatcher (inventory) ─► handler
//!                                         └─► Dispatcher (email)     ─► handler
//!                                                   │
//!                                                   ├─ IdempotencyStore (claim / outcome)
//!                                                   └─ "{topic}.dead-letter"
//! ```
//!
//! Every consumer group sees every envelope. Within a group, envelopes
//! that share an ordering key are handed out in publish order; a later one
//! waits until the earlier one is acknowledged.
//!
//! ## Features
//!
//! - `memory` (default): In-memory transport and idempotency store
//! - `redis`: Redis Streams transport and Redis idempotency store
//!
//! ## Usage
//!
//! ### Publishing Events
//!
//! ```rust,no_run
//! use event_propagation::{DomainEvent, PropagationConfig, PropagationRuntime};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct OrderCreated {
//!     order_id: String,
//! }
//!
//! impl DomainEvent for OrderCreated {
//!     fn event_type(&self) -> &str {
//!         "order.created"
//!     }
//! }
//!
//! async fn publish_example() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = PropagationRuntime::in_memory(PropagationConfig::from_env()?).await?;
//!     let publisher = runtime.publisher();
//!
//!     let event = OrderCreated { order_id: "order-42".to_string() };
//!     publisher.publish("order-events", Some("order-42"), &event).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Handling Events
//!
//! ```rust,no_run
//! use event_propagation::{HandlerError, HandlerRegistry, PropagationConfig, PropagationRuntime, TypedHandler};
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Deserialize)]
//! struct OrderCreated {
//!     order_id: String,
//! }
//!
//! async fn consume_example() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = PropagationRuntime::in_memory(PropagationConfig::default()).await?;
//!
//!     let mut registry = HandlerRegistry::new();
//!     registry.register(
//!         "order-events",
//!         "inventory",
//!         Arc::new(
//!             TypedHandler::new(|order: OrderCreated, _event| async move {
//!                 if order.order_id.is_empty() {
//!                     return Err(HandlerError::malformed("missing order id"));
//!                 }
//!                 Ok(())
//!             })
//!             .only(["order.created"]),
//!         ),
//!     )?;
//!
//!     let handle = runtime.dispatcher(registry).start().await?;
//!     // ...
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery Guarantees
//!
//! - Delivery is at-least-once. A crash after a handler succeeded but
//!   before the acknowledgment produces a redelivery, which the dispatcher
//!   acknowledges without invoking the handler again.
//! - A handler that keeps failing runs exactly `max_attempts` times; the
//!   envelope is then published to `"{topic}.dead-letter"` and acknowledged.
//! - Undecodable payloads are dead-lettered on the first attempt.

pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod idempotency;
pub mod publisher;
pub mod retry;
pub mod runtime;
pub mod transport;

// Re-export main types
pub use config::{BackoffKind, ConfigError, PropagationConfig};
pub use dead_letter::DeadLetter;
pub use dispatcher::{
    DeliveryReport, DispatchOutcome, Dispatcher, DispatcherConfig, DispatcherHandle,
    DispatcherStats,
};
pub use envelope::{ContentType, DomainEvent, EnvelopeId, EventEnvelope, Payload};
pub use error::{PropagationError, PropagationResult, StoreError, StoreResult};
pub use handler::{DecodedEvent, EventHandler, FnHandler, HandlerError, HandlerRegistry, TypedHandler};
pub use idempotency::{Claim, ConsumerRecord, IdempotencyStore, Outcome};
pub use publisher::{Publisher, PublisherConfig, PublisherStats};
pub use retry::{with_retry_if, Backoff, RetryPolicy};
pub use runtime::PropagationRuntime;
pub use transport::{
    dead_letter_topic, Delivery, EnqueueAck, Receipt, Subscription, Transport, TransportStats,
};

#[cfg(feature = "memory")]
pub use idempotency::memory::MemoryIdempotencyStore;
#[cfg(feature = "memory")]
pub use transport::memory::{MemoryTransport, MemoryTransportConfig, RetentionPolicy};

#[cfg(feature = "redis")]
pub use idempotency::redis::RedisIdempotencyStore;
#[cfg(feature = "redis")]
pub use transport::redis::{RedisTransport, RedisTransportConfig};
