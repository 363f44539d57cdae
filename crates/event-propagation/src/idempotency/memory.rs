//! In-memory idempotency store.

use super::{Claim, ConsumerRecord, IdempotencyStore, Outcome};
use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    until: Instant,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    record: Option<ConsumerRecord>,
    claim: Option<Lease>,
}

impl Slot {
    fn live_claim(&self, now: Instant) -> Option<&Lease> {
        self.claim.as_ref().filter(|lease| lease.until > now)
    }
}

/// Idempotency store backed by a sharded concurrent map.
///
/// Every read-modify-write goes through the map's entry API, which locks
/// only the shard holding the key. Clones share the same map, so replicas
/// of a dispatcher in one process can share one store.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdempotencyStore {
    slots: Arc<DashMap<(String, String), Slot>>,
}

impl MemoryIdempotencyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored outcomes.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.record.is_some()).count()
    }

    /// Whether no outcome is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(consumer_group: &str, dedup_key: &str) -> (String, String) {
        (consumer_group.to_string(), dedup_key.to_string())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn lookup(&self, consumer_group: &str, dedup_key: &str) -> StoreResult<Option<ConsumerRecord>> {
        Ok(self
            .slots
            .get(&Self::key(consumer_group, dedup_key))
            .and_then(|slot| slot.record.clone()))
    }

    async fn try_claim(
        &self,
        consumer_group: &str,
        dedup_key: &str,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<Claim> {
        let now = Instant::now();
        let mut slot = self
            .slots
            .entry(Self::key(consumer_group, dedup_key))
            .or_default();

        if let Some(record) = slot.record.as_ref().filter(|r| r.is_final()) {
            return Ok(Claim::Completed(record.clone()));
        }

        if let Some(current) = slot.live_claim(now) {
            if current.owner != owner {
                return Ok(Claim::Busy {
                    owner: current.owner.clone(),
                });
            }
        }

        slot.claim = Some(Lease {
            owner: owner.to_string(),
            until: now + lease,
        });
        Ok(Claim::Acquired)
    }

    async fn record_outcome(
        &self,
        consumer_group: &str,
        dedup_key: &str,
        outcome: Outcome,
        attempt: u32,
        owner: &str,
    ) -> StoreResult<ConsumerRecord> {
        let mut slot = self
            .slots
            .entry(Self::key(consumer_group, dedup_key))
            .or_default();

        if slot.claim.as_ref().is_some_and(|lease| lease.owner == owner) {
            slot.claim = None;
        }

        match slot.record.as_ref() {
            Some(existing) if existing.is_final() => Ok(existing.clone()),
            _ => {
                let record = ConsumerRecord::new(consumer_group, dedup_key, outcome, attempt);
                slot.record = Some(record.clone());
                Ok(record)
            }
        }
    }

    async fn release(&self, consumer_group: &str, dedup_key: &str, owner: &str) -> StoreResult<()> {
        let key = Self::key(consumer_group, dedup_key);
        if let Some(mut slot) = self.slots.get_mut(&key) {
            if slot.claim.as_ref().is_some_and(|lease| lease.owner == owner) {
                slot.claim = None;
            }
        }
        self.slots
            .remove_if(&key, |_, slot| slot.record.is_none() && slot.claim.is_none());
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            slot.live_claim(now).is_some()
                || slot
                    .record
                    .as_ref()
                    .is_some_and(|record| record.recorded_at >= cutoff)
        });
        Ok(before - self.slots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LEASE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_read_after_write() {
        let store = MemoryIdempotencyStore::new();
        assert!(store.lookup("inventory", "e1").await.unwrap().is_none());

        store
            .record_outcome("inventory", "e1", Outcome::Failed, 1, "r1")
            .await
            .unwrap();
        let record = store.lookup("inventory", "e1").await.unwrap().unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.attempt, 1);
    }

    #[tokio::test]
    async fn test_groups_are_separate_namespaces() {
        let store = MemoryIdempotencyStore::new();
        store
            .record_outcome("inventory", "e1", Outcome::Succeeded, 1, "r1")
            .await
            .unwrap();

        assert!(store.lookup("email", "e1").await.unwrap().is_none());
        assert_eq!(
            store.try_claim("email", "e1", "r2", LEASE).await.unwrap(),
            Claim::Acquired
        );
    }

    #[tokio::test]
    async fn test_succeeded_is_never_downgraded() {
        let store = MemoryIdempotencyStore::new();
        store
            .record_outcome("inventory", "e1", Outcome::Succeeded, 2, "r1")
            .await
            .unwrap();

        let stored = store
            .record_outcome("inventory", "e1", Outcome::Failed, 3, "r2")
            .await
            .unwrap();
        assert_eq!(stored.outcome, Outcome::Succeeded);
        assert_eq!(stored.attempt, 2);

        assert!(matches!(
            store.try_claim("inventory", "e1", "r3", LEASE).await.unwrap(),
            Claim::Completed(record) if record.attempt == 2
        ));
    }

    #[tokio::test]
    async fn test_dead_lettered_is_final() {
        let store = MemoryIdempotencyStore::new();
        assert_eq!(
            store.try_claim("inventory", "e1", "r1", LEASE).await.unwrap(),
            Claim::Acquired
        );
        store
            .record_outcome("inventory", "e1", Outcome::DeadLettered, 3, "r1")
            .await
            .unwrap();

        let stored = store
            .record_outcome("inventory", "e1", Outcome::Failed, 4, "r2")
            .await
            .unwrap();
        assert_eq!(stored.outcome, Outcome::DeadLettered);

        assert!(matches!(
            store.try_claim("inventory", "e1", "r2", LEASE).await.unwrap(),
            Claim::Completed(record) if record.outcome == Outcome::DeadLettered
        ));
    }

    #[tokio::test]
    async fn test_failed_outcome_allows_new_claim() {
        let store = MemoryIdempotencyStore::new();
        assert_eq!(
            store.try_claim("inventory", "e1", "r1", LEASE).await.unwrap(),
            Claim::Acquired
        );
        store
            .record_outcome("inventory", "e1", Outcome::Failed, 1, "r1")
            .await
            .unwrap();

        assert_eq!(
            store.try_claim("inventory", "e1", "r2", LEASE).await.unwrap(),
            Claim::Acquired
        );
    }

    #[tokio::test]
    async fn test_live_claim_is_exclusive_and_expires() {
        let store = MemoryIdempotencyStore::new();
        let short = Duration::from_millis(30);

        assert_eq!(
            store.try_claim("inventory", "e1", "r1", short).await.unwrap(),
            Claim::Acquired
        );
        assert_eq!(
            store.try_claim("inventory", "e1", "r2", short).await.unwrap(),
            Claim::Busy {
                owner: "r1".to_string()
            }
        );
        // holder renews
        assert_eq!(
            store.try_claim("inventory", "e1", "r1", short).await.unwrap(),
            Claim::Acquired
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.try_claim("inventory", "e1", "r2", short).await.unwrap(),
            Claim::Acquired
        );
        // an expired claim is not an outcome
        assert!(store.lookup("inventory", "e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_frees_claim() {
        let store = MemoryIdempotencyStore::new();
        store.try_claim("inventory", "e1", "r1", LEASE).await.unwrap();

        // only the holder can release
        store.release("inventory", "e1", "r2").await.unwrap();
        assert!(matches!(
            store.try_claim("inventory", "e1", "r2", LEASE).await.unwrap(),
            Claim::Busy { .. }
        ));

        store.release("inventory", "e1", "r1").await.unwrap();
        assert_eq!(
            store.try_claim("inventory", "e1", "r2", LEASE).await.unwrap(),
            Claim::Acquired
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_admit_one_owner() {
        let store = MemoryIdempotencyStore::new();
        let acquired = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for replica in 0..16 {
            let store = store.clone();
            let acquired = acquired.clone();
            tasks.push(tokio::spawn(async move {
                let owner = format!("replica-{}", replica);
                if store.try_claim("inventory", "e1", &owner, LEASE).await.unwrap() == Claim::Acquired {
                    acquired.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_purge_before() {
        let store = MemoryIdempotencyStore::new();
        store
            .record_outcome("inventory", "old", Outcome::Succeeded, 1, "r1")
            .await
            .unwrap();
        let cutoff = Utc::now() + chrono::Duration::milliseconds(1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .record_outcome("inventory", "new", Outcome::Succeeded, 1, "r1")
            .await
            .unwrap();

        assert_eq!(store.purge_before(cutoff).await.unwrap(), 1);
        assert!(store.lookup("inventory", "old").await.unwrap().is_none());
        assert!(store.lookup("inventory", "new").await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }
}
