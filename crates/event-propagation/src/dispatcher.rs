//! Dispatcher
//!
//! Pulls deliveries for every registered `(topic, consumer_group)`,
//! deduplicates them against the [`IdempotencyStore`] and invokes the
//! registered handler.
//!
//! ## Per-delivery flow
//!
//! 1. Claim the dedup key. A final outcome (`Succeeded` or
//!    `DeadLettered`) already recorded: ack and skip.
//!    Another replica holds the claim: wait for its outcome, then skip or
//!    defer.
//! 2. Decode the payload. Undecodable payloads go straight to the
//!    dead-letter topic.
//! 3. Invoke the handler. Success is recorded before the ack, so a crash
//!    in between ends in a skipped redelivery rather than a second run.
//! 4. Failure is recorded, then the delivery is nacked with the policy's
//!    delay. Once the attempts are spent the envelope is routed to the
//!    dead-letter topic, `DeadLettered` is recorded, and the delivery is
//!    acked. A redelivery after that point is skipped.

use crate::config::PropagationConfig;
use crate::dead_letter::DeadLetter;
use crate::envelope::EnvelopeId;
use crate::error::{PropagationError, PropagationResult};
use crate::handler::{DecodedEvent, EventHandler, HandlerError, HandlerRegistry};
use crate::idempotency::{Claim, IdempotencyStore, Outcome};
use crate::retry::RetryPolicy;
use crate::transport::{Delivery, Subscription, Transport};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the dispatcher did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Handler succeeded; delivery acknowledged
    Succeeded,
    /// Already succeeded earlier; acknowledged without invoking the handler
    Skipped,
    /// Handler failed; delivery nacked for a later attempt
    Retried,
    /// Routed to the dead-letter topic and acknowledged
    DeadLettered,
    /// Another replica held the claim; delivery nacked
    Deferred,
}

impl DispatchOutcome {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Succeeded => "succeeded",
            DispatchOutcome::Skipped => "skipped",
            DispatchOutcome::Retried => "retried",
            DispatchOutcome::DeadLettered => "dead_lettered",
            DispatchOutcome::Deferred => "deferred",
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observability record emitted for every processed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Envelope ID
    pub envelope_id: EnvelopeId,
    /// Topic
    pub topic: String,
    /// Consumer group
    pub consumer_group: String,
    /// Delivery attempt
    pub attempt: u32,
    /// Outcome
    pub outcome: DispatchOutcome,
    /// Failure message for `Retried`, `DeadLettered` and `Deferred`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time of the report
    pub reported_at: DateTime<Utc>,
}

/// Dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Handler invocations that succeeded
    pub succeeded: u64,
    /// Deliveries acknowledged without invoking the handler
    pub skipped: u64,
    /// Deliveries nacked after a handler failure
    pub retried: u64,
    /// Deliveries routed to a dead-letter topic
    pub dead_lettered: u64,
    /// Deliveries nacked because another replica held the claim
    pub deferred: u64,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Succeeded => &self.succeeded,
            DispatchOutcome::Skipped => &self.skipped,
            DispatchOutcome::Retried => &self.retried,
            DispatchOutcome::DeadLettered => &self.dead_lettered,
            DispatchOutcome::Deferred => &self.deferred,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Owner name used for idempotency claims
    pub replica_id: String,
    /// Lifetime of a claim; also how long a replica waits on a busy claim
    pub claim_lease: Duration,
    /// Poll interval while waiting on another replica's claim
    pub busy_poll_interval: Duration,
    /// Capacity of the report broadcast channel
    pub report_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            replica_id: format!("replica-{}", uuid::Uuid::now_v7()),
            claim_lease: Duration::from_secs(30),
            busy_poll_interval: Duration::from_millis(50),
            report_capacity: 1024,
        }
    }
}

impl DispatcherConfig {
    /// Settings derived from a runtime configuration.
    ///
    /// Claims last as long as a transport lease, so a replica that dies
    /// mid-handler frees the key about when its delivery reappears.
    pub fn from_config(config: &PropagationConfig) -> Self {
        Self {
            claim_lease: config.visibility_timeout(),
            ..Default::default()
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn IdempotencyStore>,
    policy: RetryPolicy,
    registry: HandlerRegistry,
    config: DispatcherConfig,
    reports: broadcast::Sender<DeliveryReport>,
    counters: Counters,
}

type Processed = (DispatchOutcome, Option<String>);

/// Per-service dispatcher.
///
/// Cloning is cheap. Each replica of a consumer service runs its own
/// dispatcher; replicas coordinate only through the transport and the
/// idempotency store.
///
/// # Example
///
/// ```rust
/// use event_propagation::dispatcher::Dispatcher;
/// use event_propagation::handler::{FnHandler, HandlerRegistry};
/// use event_propagation::idempotency::memory::MemoryIdempotencyStore;
/// use event_propagation::retry::RetryPolicy;
/// use event_propagation::transport::memory::MemoryTransport;
/// use event_propagation::transport::Transport;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(MemoryTransport::new());
/// transport.create_topic("order-events").await?;
///
/// let mut registry = HandlerRegistry::new();
/// registry.register(
///     "order-events",
///     "inventory",
///     Arc::new(FnHandler::new(|_event| async { Ok(()) })),
/// )?;
///
/// let dispatcher = Dispatcher::new(
///     transport,
///     Arc::new(MemoryIdempotencyStore::new()),
///     RetryPolicy::standard(),
///     registry,
/// );
/// let handle = dispatcher.start().await?;
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("replica_id", &self.inner.config.replica_id)
            .field("policy", &self.inner.policy)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher with default settings.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdempotencyStore>,
        policy: RetryPolicy,
        registry: HandlerRegistry,
    ) -> Self {
        Self::with_config(transport, store, policy, registry, DispatcherConfig::default())
    }

    /// Create with custom settings.
    pub fn with_config(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdempotencyStore>,
        policy: RetryPolicy,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(config.report_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                policy,
                registry,
                config,
                reports,
                counters: Counters::default(),
            }),
        }
    }

    /// Owner name used for claims.
    pub fn replica_id(&self) -> &str {
        &self.inner.config.replica_id
    }

    /// Subscribe to delivery reports.
    pub fn reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.inner.reports.subscribe()
    }

    /// Get dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        DispatcherStats {
            succeeded: c.succeeded.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
        }
    }

    /// Validate every registration, subscribe, and spawn one pull loop each.
    ///
    /// Nothing is spawned unless every registration is valid.
    ///
    /// # Errors
    ///
    /// * `ConsumerGroupMisconfigured` - no handler is registered
    /// * `TopicNotFound` - a registered topic was never declared
    /// * `TransportUnavailable` - subscribing failed
    pub async fn start(&self) -> PropagationResult<DispatcherHandle> {
        if self.inner.registry.is_empty() {
            return Err(PropagationError::ConsumerGroupMisconfigured(
                "no handlers registered".to_string(),
            ));
        }

        let mut subscriptions = Vec::with_capacity(self.inner.registry.len());
        for (topic, group) in self.inner.registry.registrations() {
            if !self.inner.transport.topic_exists(topic).await? {
                return Err(PropagationError::TopicNotFound(topic.to_string()));
            }
            subscriptions.push(self.inner.transport.subscribe(topic, group).await?);
        }

        let token = CancellationToken::new();
        let tasks = subscriptions
            .into_iter()
            .map(|subscription| {
                let dispatcher = self.clone();
                let token = token.child_token();
                tokio::spawn(async move { dispatcher.run(subscription, token).await })
            })
            .collect::<Vec<_>>();

        tracing::info!(
            replica_id = %self.inner.config.replica_id,
            loops = tasks.len(),
            "Dispatcher started"
        );

        Ok(DispatcherHandle { token, tasks })
    }

    async fn run(&self, mut subscription: Subscription, token: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = subscription.recv() => next,
            };

            match next {
                Ok(delivery) => {
                    if let Err(e) = self.process(&delivery).await {
                        tracing::error!(
                            envelope_id = %delivery.envelope.id,
                            topic = %subscription.topic,
                            consumer_group = %subscription.consumer_group,
                            error = %e,
                            code = e.error_code(),
                            "Failed to process delivery"
                        );
                        let delay = self.inner.policy.next_delay(delivery.attempt());
                        if let Err(nack_err) = self.inner.transport.nack(&delivery.receipt, delay).await {
                            tracing::warn!(
                                envelope_id = %delivery.envelope.id,
                                error = %nack_err,
                                "Nack failed, delivery reappears after the visibility timeout"
                            );
                        }
                    }
                }
                Err(PropagationError::ChannelClosed) => {
                    tracing::warn!(
                        topic = %subscription.topic,
                        consumer_group = %subscription.consumer_group,
                        "Subscription closed"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %subscription.topic,
                        consumer_group = %subscription.consumer_group,
                        error = %e,
                        "Subscription error"
                    );
                }
            }
        }

        tracing::info!(
            topic = %subscription.topic,
            consumer_group = %subscription.consumer_group,
            "Dispatcher loop stopped"
        );
    }

    /// Process a single delivery to completion.
    ///
    /// Handler failures are not errors: they end in `Retried` or
    /// `DeadLettered`. An `Err` means the transport or the idempotency
    /// store failed and the delivery was left unacknowledged.
    pub async fn process(&self, delivery: &Delivery) -> PropagationResult<DispatchOutcome> {
        let receipt = &delivery.receipt;
        let group = receipt.consumer_group.as_str();
        let handler = self
            .inner
            .registry
            .get(&receipt.topic, group)
            .ok_or_else(|| {
                PropagationError::ConsumerGroupMisconfigured(format!(
                    "no handler registered for topic '{}' and group '{}'",
                    receipt.topic, group
                ))
            })?;

        let dedup_key = delivery.envelope.dedup_key();
        let owner = self.inner.config.replica_id.as_str();

        let claim = self
            .inner
            .store
            .try_claim(group, &dedup_key, owner, self.inner.config.claim_lease)
            .await?;

        let (outcome, error) = match claim {
            Claim::Completed(record) => {
                tracing::debug!(
                    envelope_id = %delivery.envelope.id,
                    consumer_group = %group,
                    recorded_attempt = record.attempt,
                    outcome = %record.outcome,
                    "Already processed, skipping handler"
                );
                self.inner.transport.ack(receipt).await?;
                (DispatchOutcome::Skipped, None)
            }
            Claim::Busy { owner: holder } => self.await_holder(delivery, &dedup_key, &holder).await?,
            Claim::Acquired => match self.invoke(handler, delivery, &dedup_key).await {
                Ok(processed) => processed,
                Err(e) => {
                    if let Err(release_err) = self.inner.store.release(group, &dedup_key, owner).await {
                        tracing::warn!(
                            envelope_id = %delivery.envelope.id,
                            error = %release_err,
                            "Failed to release claim"
                        );
                    }
                    return Err(e);
                }
            },
        };

        self.report(delivery, outcome, error);
        Ok(outcome)
    }

    async fn invoke(
        &self,
        handler: Arc<dyn EventHandler>,
        delivery: &Delivery,
        dedup_key: &str,
    ) -> PropagationResult<Processed> {
        let envelope = &delivery.envelope;
        let group = delivery.receipt.consumer_group.as_str();
        let attempt = delivery.attempt();
        let policy = &self.inner.policy;

        if attempt > policy.max_attempts {
            // an earlier dead-letter route failed after the last handler run
            let err = PropagationError::HandlerFailure(format!(
                "{} attempts exhausted",
                policy.max_attempts
            ));
            return self.dead_letter(delivery, err, policy.max_attempts).await;
        }

        let body = match envelope.payload.to_value() {
            Ok(body) => body,
            Err(e) => return self.dead_letter(delivery, e, attempt).await,
        };
        let event = DecodedEvent {
            envelope: envelope.clone(),
            consumer_group: group.to_string(),
            body,
        };

        tracing::debug!(
            envelope_id = %envelope.id,
            event_type = %envelope.payload.type_tag,
            consumer_group = %group,
            attempt,
            "Invoking handler"
        );

        let result = AssertUnwindSafe(handler.handle(event))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::failed("handler panicked")));

        match result {
            Ok(()) => {
                self.record(group, dedup_key, Outcome::Succeeded, attempt).await?;
                self.inner.transport.ack(&delivery.receipt).await?;
                Ok((DispatchOutcome::Succeeded, None))
            }
            Err(err @ HandlerError::Malformed(_)) => self.dead_letter(delivery, err.into(), attempt).await,
            Err(HandlerError::Failed(message)) => {
                let err = PropagationError::HandlerFailure(message);
                if policy.should_dead_letter(attempt) {
                    return self.dead_letter(delivery, err, attempt).await;
                }

                self.record(group, dedup_key, Outcome::Failed, attempt).await?;
                let delay = policy.next_delay(attempt);
                self.inner.transport.nack(&delivery.receipt, delay).await?;
                Ok((DispatchOutcome::Retried, Some(err.to_string())))
            }
        }
    }

    async fn record(&self, group: &str, dedup_key: &str, outcome: Outcome, attempt: u32) -> PropagationResult<()> {
        let stored = self
            .inner
            .store
            .record_outcome(group, dedup_key, outcome, attempt, &self.inner.config.replica_id)
            .await?;
        if stored.outcome != outcome {
            tracing::warn!(
                consumer_group = %group,
                dedup_key = %dedup_key,
                attempted = %outcome,
                stored = %stored.outcome,
                "Outcome not recorded over a final outcome"
            );
        }
        Ok(())
    }

    /// Route to the dead-letter topic, record `DeadLettered`, then ack.
    ///
    /// A crash before the record is written ends in a second dead-letter
    /// entry carrying the same idempotency key.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        error: PropagationError,
        attempts: u32,
    ) -> PropagationResult<Processed> {
        let group = delivery.receipt.consumer_group.as_str();
        let record = DeadLetter::new(
            delivery.envelope.clone(),
            delivery.receipt.consumer_group.clone(),
            &error,
            attempts,
        );
        let envelope = record.to_envelope()?;
        let ack = self.inner.transport.enqueue(envelope).await?;
        self.record(group, &delivery.envelope.dedup_key(), Outcome::DeadLettered, attempts)
            .await?;
        self.inner.transport.ack(&delivery.receipt).await?;

        tracing::error!(
            envelope_id = %delivery.envelope.id,
            topic = %delivery.receipt.topic,
            consumer_group = %delivery.receipt.consumer_group,
            dead_letter_topic = %ack.topic,
            attempts,
            error = %error,
            "Envelope dead-lettered"
        );

        Ok((DispatchOutcome::DeadLettered, Some(error.to_string())))
    }

    /// Wait for the replica holding the claim to commit an outcome.
    async fn await_holder(&self, delivery: &Delivery, dedup_key: &str, holder: &str) -> PropagationResult<Processed> {
        let group = delivery.receipt.consumer_group.as_str();
        let started = Utc::now();
        let deadline = tokio::time::Instant::now() + self.inner.config.claim_lease;

        tracing::debug!(
            envelope_id = %delivery.envelope.id,
            consumer_group = %group,
            holder = %holder,
            "Claim held by another replica, waiting for its outcome"
        );

        loop {
            if let Some(record) = self.inner.store.lookup(group, dedup_key).await? {
                if record.is_final() {
                    self.inner.transport.ack(&delivery.receipt).await?;
                    return Ok((DispatchOutcome::Skipped, None));
                }
                if record.recorded_at >= started {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.inner.config.busy_poll_interval).await;
        }

        let delay = self.inner.policy.next_delay(delivery.attempt());
        self.inner.transport.nack(&delivery.receipt, delay).await?;
        Ok((
            DispatchOutcome::Deferred,
            Some(format!("claim held by '{}'", holder)),
        ))
    }

    fn report(&self, delivery: &Delivery, outcome: DispatchOutcome, error: Option<String>) {
        self.inner.counters.record(outcome);

        let envelope_id = delivery.envelope.id;
        let topic = delivery.receipt.topic.as_str();
        let group = delivery.receipt.consumer_group.as_str();
        let attempt = delivery.attempt();
        let error_text = error.as_deref().unwrap_or("");

        match outcome {
            DispatchOutcome::Succeeded | DispatchOutcome::Skipped => tracing::info!(
                envelope_id = %envelope_id,
                topic = %topic,
                consumer_group = %group,
                attempt,
                outcome = %outcome,
                "Delivery processed"
            ),
            DispatchOutcome::Retried => tracing::warn!(
                envelope_id = %envelope_id,
                topic = %topic,
                consumer_group = %group,
                attempt,
                outcome = %outcome,
                error = %error_text,
                "Delivery processed"
            ),
            DispatchOutcome::DeadLettered => tracing::error!(
                envelope_id = %envelope_id,
                topic = %topic,
                consumer_group = %group,
                attempt,
                outcome = %outcome,
                error = %error_text,
                "Delivery processed"
            ),
            DispatchOutcome::Deferred => tracing::debug!(
                envelope_id = %envelope_id,
                topic = %topic,
                consumer_group = %group,
                attempt,
                outcome = %outcome,
                error = %error_text,
                "Delivery processed"
            ),
        }

        // no subscribers is fine
        let _ = self.inner.reports.send(DeliveryReport {
            envelope_id,
            topic: topic.to_string(),
            consumer_group: group.to_string(),
            attempt,
            outcome,
            error,
            reported_at: Utc::now(),
        });
    }
}

/// Handle to the pull loops spawned by [`Dispatcher::start`].
///
/// Dropping the handle leaves the loops running.
#[derive(Debug)]
pub struct DispatcherHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop pulling and wait for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Dispatcher loop panicked");
                }
            }
        }
        tracing::info!("Dispatcher shut down");
    }

    /// Stop immediately. In-flight deliveries stay unacknowledged and are
    /// handed out again by the transport.
    pub fn abort(self) {
        self.token.cancel();
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!("Dispatcher aborted");
    }

    /// Token cancelled on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether every pull loop has exited.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|task| task.is_finished())
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::envelope::{EventEnvelope, Payload};
    use crate::handler::FnHandler;
    use crate::idempotency::memory::MemoryIdempotencyStore;
    use crate::retry::Backoff;
    use crate::transport::memory::{MemoryTransport, MemoryTransportConfig, RetentionPolicy};
    use crate::transport::dead_letter_topic;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    const TOPIC: &str = "order-events";
    const GROUP: &str = "inventory";

    struct Fixture {
        transport: Arc<MemoryTransport>,
        store: Arc<MemoryIdempotencyStore>,
        calls: Arc<AtomicU32>,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MemoryTransport::with_config(MemoryTransportConfig {
            visibility_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(5),
            retention: RetentionPolicy::default(),
        }));
        transport.create_topic(TOPIC).await.unwrap();
        Fixture {
            transport,
            store: Arc::new(MemoryIdempotencyStore::new()),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::Fixed(Duration::from_millis(1)))
    }

    fn dispatcher<H>(fx: &Fixture, max_attempts: u32, handler: H) -> Dispatcher
    where
        H: EventHandler + 'static,
    {
        let mut registry = HandlerRegistry::new();
        registry.register(TOPIC, GROUP, Arc::new(handler)).unwrap();
        Dispatcher::with_config(
            fx.transport.clone(),
            fx.store.clone(),
            policy(max_attempts),
            registry,
            DispatcherConfig {
                replica_id: "replica-a".to_string(),
                claim_lease: Duration::from_millis(100),
                busy_poll_interval: Duration::from_millis(5),
                report_capacity: 16,
            },
        )
    }

    fn counting(calls: Arc<AtomicU32>, fail: bool) -> impl EventHandler {
        FnHandler::new(move |_event| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(HandlerError::failed("downstream rejected"))
                } else {
                    Ok(())
                }
            }
        })
    }

    async fn publish(fx: &Fixture, payload: Payload) -> EventEnvelope {
        let envelope = EventEnvelope::new(TOPIC, payload).with_ordering_key("order-42");
        fx.transport.enqueue(envelope.clone()).await.unwrap();
        envelope
    }

    async fn next_delivery(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timeout")
            .expect("delivery")
    }

    fn created() -> Payload {
        Payload::json("order.created", &json!({"order_id": "order-42"})).unwrap()
    }

    #[tokio::test]
    async fn test_success_records_and_acks() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 3, counting(fx.calls.clone(), false));
        let mut reports = dispatcher.reports();
        let envelope = publish(&fx, created()).await;

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let delivery = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&delivery).await.unwrap(), DispatchOutcome::Succeeded);

        let record = fx.store.lookup(GROUP, &envelope.id.to_string()).await.unwrap().unwrap();
        assert_eq!(record.outcome, Outcome::Succeeded);
        assert_eq!(fx.transport.unacknowledged(TOPIC, GROUP).await.unwrap(), 0);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.envelope_id, envelope.id);
        assert_eq!(report.outcome, DispatchOutcome::Succeeded);
        assert_eq!(report.attempt, 1);
        assert_eq!(dispatcher.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_success_is_skipped() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 3, counting(fx.calls.clone(), false));
        publish(&fx, created()).await;

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let delivery = next_delivery(&mut sub).await;
        dispatcher.process(&delivery).await.unwrap();

        fx.transport.rewind(TOPIC, GROUP).await.unwrap();
        let again = next_delivery(&mut sub).await;
        assert_eq!(again.attempt(), 1);
        assert_eq!(dispatcher.process(&again).await.unwrap(), DispatchOutcome::Skipped);

        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_failure_is_nacked_until_dead_letter() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 2, counting(fx.calls.clone(), true));
        publish(&fx, created()).await;

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let first = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&first).await.unwrap(), DispatchOutcome::Retried);

        let second = next_delivery(&mut sub).await;
        assert_eq!(second.attempt(), 2);
        assert_eq!(dispatcher.process(&second).await.unwrap(), DispatchOutcome::DeadLettered);

        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.transport.unacknowledged(TOPIC, GROUP).await.unwrap(), 0);

        let dead = fx.transport.retained(&dead_letter_topic(TOPIC)).await.unwrap();
        assert_eq!(dead.len(), 1);
        let record = DeadLetter::from_envelope(&dead[0]).unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.consumer_group, GROUP);
        assert_eq!(record.error_code, "HANDLER_FAILURE");
        assert_eq!(dead[0].ordering_key.as_deref(), Some("order-42"));
    }

    #[tokio::test]
    async fn test_redelivery_after_dead_letter_is_skipped() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 1, counting(fx.calls.clone(), true));
        let envelope = publish(&fx, created()).await;
        let key = envelope.id.to_string();

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let first = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&first).await.unwrap(), DispatchOutcome::DeadLettered);

        let record = fx.store.lookup(GROUP, &key).await.unwrap().unwrap();
        assert_eq!(record.outcome, Outcome::DeadLettered);
        assert_eq!(record.attempt, 1);
        // the claim is gone; any replica now sees the final outcome
        assert!(matches!(
            fx.store.try_claim(GROUP, &key, "replica-b", Duration::from_secs(5)).await.unwrap(),
            Claim::Completed(_)
        ));

        fx.transport.rewind(TOPIC, GROUP).await.unwrap();
        let again = next_delivery(&mut sub).await;
        assert_eq!(again.attempt(), 1);
        assert_eq!(dispatcher.process(&again).await.unwrap(), DispatchOutcome::Skipped);

        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transport.retained(&dead_letter_topic(TOPIC)).await.unwrap().len(), 1);
        assert_eq!(fx.transport.unacknowledged(TOPIC, GROUP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_busy_claim_skips_when_holder_dead_letters() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 3, counting(fx.calls.clone(), false));
        let envelope = publish(&fx, created()).await;
        let key = envelope.id.to_string();
        fx.store
            .try_claim(GROUP, &key, "replica-b", Duration::from_secs(5))
            .await
            .unwrap();
        fx.store
            .record_outcome(GROUP, &key, Outcome::DeadLettered, 3, "replica-b")
            .await
            .unwrap();

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let delivery = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&delivery).await.unwrap(), DispatchOutcome::Skipped);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered_immediately() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 5, counting(fx.calls.clone(), false));
        let broken = Payload {
            type_tag: "order.created".to_string(),
            content_type: crate::envelope::ContentType::Json,
            data: b"{not json".to_vec(),
        };
        publish(&fx, broken).await;

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let delivery = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&delivery).await.unwrap(), DispatchOutcome::DeadLettered);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);

        let dead = fx.transport.retained(&dead_letter_topic(TOPIC)).await.unwrap();
        let record = DeadLetter::from_envelope(&dead[0]).unwrap();
        assert_eq!(record.error_code, "SERIALIZATION_ERROR");
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_malformed_handler_error_skips_retries() {
        let fx = fixture().await;
        let dispatcher = dispatcher(
            &fx,
            5,
            FnHandler::new(|_event| async { Err(HandlerError::malformed("missing order_id")) }),
        );
        publish(&fx, created()).await;

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let delivery = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&delivery).await.unwrap(), DispatchOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn test_handler_panic_counts_as_failure() {
        let fx = fixture().await;
        let dispatcher = dispatcher(
            &fx,
            3,
            FnHandler::new(|event: DecodedEvent| async move {
                if event.attempt() > 0 {
                    panic!("handler bug");
                }
                Ok(())
            }),
        );
        publish(&fx, created()).await;

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let delivery = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&delivery).await.unwrap(), DispatchOutcome::Retried);
    }

    #[tokio::test]
    async fn test_spent_attempts_skip_the_handler() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 1, counting(fx.calls.clone(), true));
        let envelope = publish(&fx, created()).await;

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let first = next_delivery(&mut sub).await;
        // dead-letter route fails: the delivery stays unacknowledged
        fx.transport.set_available(false);
        assert!(dispatcher.process(&first).await.is_err());
        fx.transport.set_available(true);
        fx.transport.restart().await;

        let second = next_delivery(&mut sub).await;
        assert_eq!(second.attempt(), 2);
        assert_eq!(dispatcher.process(&second).await.unwrap(), DispatchOutcome::DeadLettered);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transport.retained(&dead_letter_topic(TOPIC)).await.unwrap().len(), 1);

        let record = fx.store.lookup(GROUP, &envelope.id.to_string()).await.unwrap().unwrap();
        assert_eq!(record.outcome, Outcome::DeadLettered);
    }

    #[tokio::test]
    async fn test_busy_claim_defers() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 3, counting(fx.calls.clone(), false));
        let envelope = publish(&fx, created()).await;
        fx.store
            .try_claim(GROUP, &envelope.id.to_string(), "replica-b", Duration::from_secs(5))
            .await
            .unwrap();

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let delivery = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&delivery).await.unwrap(), DispatchOutcome::Deferred);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.stats().deferred, 1);
    }

    #[tokio::test]
    async fn test_busy_claim_skips_when_holder_succeeds() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 3, counting(fx.calls.clone(), false));
        let envelope = publish(&fx, created()).await;
        let key = envelope.id.to_string();
        fx.store
            .try_claim(GROUP, &key, "replica-b", Duration::from_secs(5))
            .await
            .unwrap();

        let store = fx.store.clone();
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store
                .record_outcome(GROUP, &key, Outcome::Succeeded, 1, "replica-b")
                .await
                .unwrap();
        });

        let mut sub = fx.transport.subscribe(TOPIC, GROUP).await.unwrap();
        let delivery = next_delivery(&mut sub).await;
        assert_eq!(dispatcher.process(&delivery).await.unwrap(), DispatchOutcome::Skipped);
        holder.await.unwrap();
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_fails_fast() {
        let fx = fixture().await;

        let empty = Dispatcher::new(
            fx.transport.clone(),
            fx.store.clone(),
            policy(3),
            HandlerRegistry::new(),
        );
        assert!(matches!(
            empty.start().await,
            Err(PropagationError::ConsumerGroupMisconfigured(_))
        ));

        let mut registry = HandlerRegistry::new();
        registry
            .register("payment-events", GROUP, Arc::new(counting(fx.calls.clone(), false)))
            .unwrap();
        let unknown = Dispatcher::new(fx.transport.clone(), fx.store.clone(), policy(3), registry);
        let err = unknown.start().await.unwrap_err();
        assert!(matches!(err, PropagationError::TopicNotFound(ref t) if t == "payment-events"));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_started_dispatcher_processes_and_shuts_down() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, 3, counting(fx.calls.clone(), false));
        let mut reports = dispatcher.reports();
        let handle = dispatcher.start().await.unwrap();

        publish(&fx, created()).await;
        let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, DispatchOutcome::Succeeded);

        handle.shutdown().await;
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }
}
