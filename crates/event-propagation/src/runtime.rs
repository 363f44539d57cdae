//! Composition root.
//!
//! [`PropagationRuntime`] builds the transport, idempotency store and retry
//! policy once from a [`PropagationConfig`] and hands shared handles to
//! publishers and dispatchers.

use crate::config::{ConfigError, PropagationConfig};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::PropagationResult;
use crate::handler::HandlerRegistry;
use crate::idempotency::IdempotencyStore;
use crate::publisher::{Publisher, PublisherConfig};
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use chrono::Utc;
use std::sync::Arc;

/// Shared transport, store and policy for one service.
///
/// # Example
///
/// ```rust
/// use event_propagation::config::PropagationConfig;
/// use event_propagation::handler::{FnHandler, HandlerRegistry};
/// use event_propagation::runtime::PropagationRuntime;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = PropagationRuntime::in_memory(PropagationConfig::default()).await?;
///
/// let mut registry = HandlerRegistry::new();
/// registry.register(
///     "order-events",
///     "inventory",
///     Arc::new(FnHandler::new(|_event| async { Ok(()) })),
/// )?;
/// let handle = runtime.dispatcher(registry).start().await?;
///
/// let _publisher = runtime.publisher();
/// # handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PropagationRuntime {
    config: PropagationConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn IdempotencyStore>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for PropagationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationRuntime")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish()
    }
}

impl PropagationRuntime {
    /// Single-process runtime on the in-memory transport and store.
    #[cfg(feature = "memory")]
    pub async fn in_memory(config: PropagationConfig) -> PropagationResult<Self> {
        use crate::idempotency::memory::MemoryIdempotencyStore;
        use crate::transport::memory::{MemoryTransport, MemoryTransportConfig, RetentionPolicy};

        config.validate()?;
        let transport = MemoryTransport::with_config(MemoryTransportConfig {
            visibility_timeout: config.visibility_timeout(),
            retention: RetentionPolicy::time(config.retention()),
            ..Default::default()
        });

        Self::from_parts(
            config,
            Arc::new(transport),
            Arc::new(MemoryIdempotencyStore::new()),
        )
        .await
    }

    /// Distributed runtime on Redis Streams and a Redis idempotency store.
    ///
    /// The first entry of `bootstrap_endpoints` is the Redis URL.
    #[cfg(feature = "redis")]
    pub async fn connect_redis(config: PropagationConfig) -> PropagationResult<Self> {
        use crate::idempotency::redis::RedisIdempotencyStore;
        use crate::transport::redis::{RedisTransport, RedisTransportConfig};

        config.validate()?;
        let url = config.require_endpoints()?.to_string();

        let transport = RedisTransport::connect(
            &url,
            RedisTransportConfig {
                key_prefix: config.key_prefix.clone(),
                visibility_timeout: config.visibility_timeout(),
                max_age: Some(config.retention()),
                ..Default::default()
            },
        )
        .await?;
        let store = RedisIdempotencyStore::connect(&url, &config.key_prefix).await?;

        Self::from_parts(config, Arc::new(transport), Arc::new(store)).await
    }

    /// Runtime over caller-built components.
    ///
    /// Validates the configuration and declares the configured topic (and
    /// its dead-letter topic).
    pub async fn from_parts(
        config: PropagationConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdempotencyStore>,
    ) -> PropagationResult<Self> {
        config.validate()?;
        transport.create_topic(&config.topic).await?;

        let policy = RetryPolicy::from_config(&config);
        tracing::info!(
            topic = %config.topic,
            consumer_group = %config.consumer_group,
            max_attempts = policy.max_attempts,
            "Propagation runtime ready"
        );

        Ok(Self {
            config,
            transport,
            store,
            policy,
        })
    }

    /// Configuration the runtime was built from.
    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Shared transport.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Shared idempotency store.
    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        self.store.clone()
    }

    /// Retry policy for handler failures.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Publisher on the shared transport.
    pub fn publisher(&self) -> Publisher {
        Publisher::with_config(self.transport.clone(), PublisherConfig::from_config(&self.config))
    }

    /// Dispatcher for `registry` on the shared transport and store.
    pub fn dispatcher(&self, registry: HandlerRegistry) -> Dispatcher {
        Dispatcher::with_config(
            self.transport.clone(),
            self.store.clone(),
            self.policy,
            registry,
            DispatcherConfig::from_config(&self.config),
        )
    }

    /// Delete idempotency records older than the transport retention.
    ///
    /// Envelopes older than that are gone from the transport, so their
    /// records can no longer prevent a redelivery.
    pub async fn purge_expired_records(&self) -> PropagationResult<usize> {
        let retention = chrono::Duration::from_std(self.config.retention()).map_err(|e| {
            ConfigError::InvalidValue {
                key: "retention_secs".to_string(),
                message: e.to_string(),
            }
        })?;
        let purged = self.store.purge_before(Utc::now() - retention).await?;
        tracing::info!(purged, "Purged expired idempotency records");
        Ok(purged)
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::error::PropagationError;
    use crate::idempotency::Outcome;

    #[tokio::test]
    async fn test_in_memory_declares_topic() {
        let runtime = PropagationRuntime::in_memory(PropagationConfig::default())
            .await
            .unwrap();
        let transport = runtime.transport();
        assert!(transport.topic_exists("order-events").await.unwrap());
        assert!(transport.topic_exists("order-events.dead-letter").await.unwrap());
        assert_eq!(runtime.policy().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let config = PropagationConfig {
            consumer_group: String::new(),
            ..Default::default()
        };
        let err = PropagationRuntime::in_memory(config).await.unwrap_err();
        assert!(matches!(err, PropagationError::Config(ConfigError::InvalidValue { .. })));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_zero_retention_is_rejected() {
        let config = PropagationConfig {
            retention_secs: 0,
            ..Default::default()
        };
        let err = PropagationRuntime::in_memory(config).await.unwrap_err();
        assert!(matches!(
            err,
            PropagationError::Config(ConfigError::InvalidValue { ref key, .. }) if key == "retention_secs"
        ));
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_records() {
        let runtime = PropagationRuntime::in_memory(PropagationConfig::default())
            .await
            .unwrap();
        runtime
            .store()
            .record_outcome("inventory", "e1", Outcome::Succeeded, 1, "r1")
            .await
            .unwrap();

        assert_eq!(runtime.purge_expired_records().await.unwrap(), 0);
        assert!(runtime.store().lookup("inventory", "e1").await.unwrap().is_some());
    }
}
