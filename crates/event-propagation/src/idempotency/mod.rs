//! Idempotency store
//!
//! Records, per consumer group, which envelopes were processed and how.
//! Dispatchers consult it before invoking a handler so that redeliveries
//! of an already-succeeded envelope are acknowledged without running the
//! handler again.
//!
//! ## Claims
//!
//! Replicas of one consumer group may race on the same envelope. Before
//! invoking the handler a dispatcher takes a claim with
//! [`IdempotencyStore::try_claim`]. A claim is an expiring lease, not a
//! stored outcome: if its holder dies, the lease runs out and the next
//! delivery can claim again. Only outcomes are ever persisted.
//!
//! `Succeeded` and `DeadLettered` are final: a redelivery of a key with a
//! final outcome is acknowledged without invoking the handler, and a final
//! record is never overwritten.

use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Terminal processing outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Handler completed; never invoke it again for this key
    Succeeded,
    /// Handler failed on the recorded attempt
    Failed,
    /// Failed for good and routed to the dead-letter topic
    DeadLettered,
}

impl Outcome {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "SUCCEEDED",
            Outcome::Failed => "FAILED",
            Outcome::DeadLettered => "DEAD_LETTERED",
        }
    }

    /// Whether no further handler run may happen for the key.
    pub fn is_final(&self) -> bool {
        matches!(self, Outcome::Succeeded | Outcome::DeadLettered)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored outcome for one `(consumer_group, dedup_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRecord {
    /// Consumer group namespace
    pub consumer_group: String,
    /// Envelope id or caller-supplied idempotency key
    pub dedup_key: String,
    /// Latest outcome
    pub outcome: Outcome,
    /// Attempt that produced the outcome
    pub attempt: u32,
    /// Time of the write
    pub recorded_at: DateTime<Utc>,
}

impl ConsumerRecord {
    /// Build a record stamped with the current time.
    pub fn new(
        consumer_group: impl Into<String>,
        dedup_key: impl Into<String>,
        outcome: Outcome,
        attempt: u32,
    ) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            dedup_key: dedup_key.into(),
            outcome,
            attempt,
            recorded_at: Utc::now(),
        }
    }

    /// Whether the handler completed.
    pub fn is_succeeded(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Whether the handler must be skipped.
    pub fn is_final(&self) -> bool {
        self.outcome.is_final()
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Caller may invoke the handler
    Acquired,
    /// Final outcome recorded; skip and acknowledge
    Completed(ConsumerRecord),
    /// Another replica holds a live claim
    Busy {
        /// Current claim holder
        owner: String,
    },
}

/// Idempotency store used by dispatchers.
///
/// Implementations must give read-after-write consistency, and must
/// serialize writes per `(consumer_group, dedup_key)` without taking a
/// lock over a whole group.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Get the recorded outcome, if any.
    async fn lookup(&self, consumer_group: &str, dedup_key: &str) -> StoreResult<Option<ConsumerRecord>>;

    /// Claim the key for processing.
    ///
    /// Returns `Completed` if a final outcome is recorded, `Busy` if another
    /// owner holds an unexpired claim, and `Acquired` otherwise. Claiming a
    /// key already held by `owner` renews the lease.
    async fn try_claim(
        &self,
        consumer_group: &str,
        dedup_key: &str,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<Claim>;

    /// Record an outcome and release the caller's claim.
    ///
    /// A final record is never overwritten; the stored record is returned
    /// in every case.
    async fn record_outcome(
        &self,
        consumer_group: &str,
        dedup_key: &str,
        outcome: Outcome,
        attempt: u32,
        owner: &str,
    ) -> StoreResult<ConsumerRecord>;

    /// Give up a claim without recording an outcome.
    async fn release(&self, consumer_group: &str, dedup_key: &str, owner: &str) -> StoreResult<()>;

    /// Delete records written before `cutoff`. Returns the number removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

impl fmt::Debug for dyn IdempotencyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyStore")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(serde_json::to_string(&Outcome::Succeeded).unwrap(), "\"SUCCEEDED\"");
        assert_eq!(Outcome::Failed.to_string(), "FAILED");
        assert_eq!(
            serde_json::to_string(&Outcome::DeadLettered).unwrap(),
            "\"DEAD_LETTERED\""
        );
    }

    #[test]
    fn test_final_outcomes() {
        assert!(Outcome::Succeeded.is_final());
        assert!(Outcome::DeadLettered.is_final());
        assert!(!Outcome::Failed.is_final());
    }

    #[test]
    fn test_record_round_trip() {
        let record = ConsumerRecord::new("inventory", "abc", Outcome::Succeeded, 2);
        let json = serde_json::to_string(&record).unwrap();
        let back: ConsumerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(back.is_succeeded());
    }
}
