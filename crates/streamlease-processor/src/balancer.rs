//! Ownership Balancer - Partition Load Distribution
//!
//! The balancer decides, once per polling round, which ownership records
//! this processor should claim. It is a pure function of the full
//! partition-id list, the current ownership snapshot, this processor's
//! identity, and the ownership timeout; its only I/O is reading the
//! snapshot and submitting the claim batch.
//!
//! ## How It Works
//!
//! 1. **Warm start**: on the first round, greedily claim every partition
//!    that is unowned or whose owner timed out
//! 2. **Steady state**: keep renewing what we hold; while below our fair
//!    share (`total / active_owners`, floor), claim one random unowned or
//!    timed-out partition per round
//! 3. **Steal**: when nothing is claimable and we are still below target,
//!    rewrite the owner of one random partition held by the richest
//!    active owner and let the store's compare-and-swap arbitrate
//!
//! Random selection is deliberate: processors racing for the same
//! partition are less likely to collide round after round. A lost claim
//! race is not an error; the loser simply does not gain that partition
//! this round.

use crate::consumer::StreamClient;
use crate::error::{ProcessorError, Result};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use streamlease_store::{now_ms, CheckpointStore, OwnershipRecord};
use tracing::{debug, info};

/// Computes and submits this processor's ownership claims each round.
pub struct OwnershipBalancer {
    store: Arc<dyn CheckpointStore>,
    client: Arc<dyn StreamClient>,
    namespace: String,
    stream: String,
    consumer_group: String,
    owner_id: String,
    ownership_timeout: Duration,
    pinned_partition: Option<String>,

    /// Full partition-id list, fetched once and cached for the process
    /// lifetime (partition counts change rarely).
    partition_ids: Option<Vec<String>>,

    /// First-round flag enabling the greedy warm start.
    initializing: bool,
}

impl OwnershipBalancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        client: Arc<dyn StreamClient>,
        namespace: impl Into<String>,
        stream: impl Into<String>,
        consumer_group: impl Into<String>,
        owner_id: impl Into<String>,
        ownership_timeout: Duration,
        pinned_partition: Option<String>,
    ) -> Self {
        Self {
            store,
            client,
            namespace: namespace.into(),
            stream: stream.into(),
            consumer_group: consumer_group.into(),
            owner_id: owner_id.into(),
            ownership_timeout,
            pinned_partition,
            partition_ids: None,
            initializing: true,
        }
    }

    /// Run one balancing round.
    ///
    /// Returns the partition ids this processor owns as of this round:
    /// renewed holdings plus whatever new claims survived the store's
    /// compare-and-swap.
    ///
    /// # Errors
    ///
    /// - `InvalidPartition`: a pinned partition id is not in the stream's
    ///   partition list (fatal misconfiguration)
    /// - `Consumer` / `Store`: transient I/O failures; the caller retries
    ///   next round
    pub async fn claim_ownership(&mut self) -> Result<Vec<String>> {
        if self.partition_ids.is_none() {
            let ids = self.client.partition_ids().await?;
            debug!(
                owner_id = %self.owner_id,
                partition_count = ids.len(),
                "Fetched partition id list"
            );
            self.partition_ids = Some(ids);
        }
        let all = self.partition_ids.as_ref().expect("cached above").clone();

        // Pinned-partition mode disables balancing entirely: no ownership
        // rows are written, the processor just consumes that partition.
        if let Some(pinned) = &self.pinned_partition {
            if all.iter().any(|p| p == pinned) {
                return Ok(vec![pinned.clone()]);
            }
            return Err(ProcessorError::InvalidPartition {
                partition_id: pinned.clone(),
                available: all,
            });
        }

        let snapshot = self
            .store
            .list_ownership(&self.namespace, &self.stream, &self.consumer_group)
            .await?;

        let to_claim = self.balance(&all, &snapshot);
        if to_claim.is_empty() {
            return Ok(Vec::new());
        }

        let claimed = self.store.claim_ownership(to_claim).await?;
        let owned: Vec<String> = claimed.into_iter().map(|r| r.partition_id).collect();

        debug!(
            owner_id = %self.owner_id,
            owned_count = owned.len(),
            "Balancing round complete"
        );

        Ok(owned)
    }

    /// Decide which records to claim this round. Pure; no I/O.
    fn balance(&mut self, all: &[String], snapshot: &[OwnershipRecord]) -> Vec<OwnershipRecord> {
        let now = now_ms();
        let timeout_ms = self.ownership_timeout.as_millis() as i64;

        let owned_ids: HashSet<&str> = snapshot.iter().map(|r| r.partition_id.as_str()).collect();

        // Partitions anyone may take: never claimed, or claimed but stale.
        let mut claimable: Vec<OwnershipRecord> = all
            .iter()
            .filter(|p| !owned_ids.contains(p.as_str()))
            .map(|p| self.fresh_claim(p, now))
            .collect();
        claimable.extend(
            snapshot
                .iter()
                .filter(|r| r.is_expired(now, timeout_ms))
                .map(|r| self.take_over(r)),
        );

        let active: Vec<&OwnershipRecord> = snapshot
            .iter()
            .filter(|r| !r.is_expired(now, timeout_ms))
            .collect();
        let mine: Vec<OwnershipRecord> = active
            .iter()
            .filter(|r| r.owner_id == self.owner_id)
            .map(|r| (*r).clone())
            .collect();

        if self.initializing {
            self.initializing = false;
            if !claimable.is_empty() {
                info!(
                    owner_id = %self.owner_id,
                    claim_count = claimable.len(),
                    "Warm start, claiming all available partitions"
                );
                let mut to_claim = mine;
                to_claim.extend(claimable);
                return to_claim;
            }
            // Everything is actively owned; balance like any other round.
        }

        let mut owner_counts: HashMap<&str, usize> = HashMap::new();
        for record in &active {
            *owner_counts.entry(record.owner_id.as_str()).or_insert(0) += 1;
        }
        let mut owners_count = owner_counts.len();
        if !owner_counts.contains_key(self.owner_id.as_str()) {
            owners_count += 1;
        }

        // Floor division: the richest owner may hold one extra partition,
        // which self-corrects as more owners show up.
        let target = all.len() / owners_count.max(1);

        // Always renew current holdings so they do not time out.
        let mut to_claim = mine;

        if to_claim.len() < target {
            let mut rng = rand::thread_rng();

            if let Some(pick) = claimable.choose(&mut rng) {
                debug!(
                    owner_id = %self.owner_id,
                    partition_id = %pick.partition_id,
                    "Claiming available partition"
                );
                to_claim.push(pick.clone());
            } else if let Some(victim) = self.pick_steal_victim(&active, &owner_counts) {
                info!(
                    owner_id = %self.owner_id,
                    partition_id = %victim.partition_id,
                    from_owner = %victim.owner_id,
                    "Below fair share with nothing claimable, stealing partition"
                );
                to_claim.push(self.take_over(victim));
            }
        }

        to_claim
    }

    /// Random partition of the most-loaded active owner (ties broken
    /// randomly). The store's compare-and-swap decides whether the steal
    /// lands; the previous owner notices on its next round.
    fn pick_steal_victim<'a>(
        &self,
        active: &[&'a OwnershipRecord],
        owner_counts: &HashMap<&str, usize>,
    ) -> Option<&'a OwnershipRecord> {
        let max_count = owner_counts
            .iter()
            .filter(|(owner, _)| **owner != self.owner_id)
            .map(|(_, count)| *count)
            .max()?;

        let richest: Vec<&str> = owner_counts
            .iter()
            .filter(|(owner, count)| **owner != self.owner_id && **count == max_count)
            .map(|(owner, _)| *owner)
            .collect();

        let mut rng = rand::thread_rng();
        let owner = richest.choose(&mut rng)?;

        let candidates: Vec<&&OwnershipRecord> = active
            .iter()
            .filter(|r| r.owner_id == *owner)
            .collect();
        candidates.choose(&mut rng).map(|r| **r)
    }

    fn fresh_claim(&self, partition_id: &str, now: i64) -> OwnershipRecord {
        OwnershipRecord {
            namespace: self.namespace.clone(),
            stream: self.stream.clone(),
            consumer_group: self.consumer_group.clone(),
            partition_id: partition_id.to_string(),
            owner_id: self.owner_id.clone(),
            last_modified_ms: now,
            version_token: None,
        }
    }

    /// Rewrite an observed record's owner to self, keeping the observed
    /// token so the store's CAS arbitrates the takeover.
    fn take_over(&self, record: &OwnershipRecord) -> OwnershipRecord {
        OwnershipRecord {
            owner_id: self.owner_id.clone(),
            ..record.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStreamClient;
    use streamlease_store::{CheckpointStore, InMemoryCheckpointStore};

    fn balancer(
        store: &Arc<InMemoryCheckpointStore>,
        client: &Arc<InMemoryStreamClient>,
        owner_id: &str,
        timeout: Duration,
        pinned: Option<String>,
    ) -> OwnershipBalancer {
        OwnershipBalancer::new(
            Arc::clone(store) as Arc<dyn CheckpointStore>,
            Arc::clone(client) as Arc<dyn StreamClient>,
            "ns1",
            "orders",
            "$default",
            owner_id,
            timeout,
            pinned,
        )
    }

    async fn owner_counts(store: &InMemoryCheckpointStore) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for record in store
            .list_ownership("ns1", "orders", "$default")
            .await
            .unwrap()
        {
            *counts.entry(record.owner_id).or_insert(0) += 1;
        }
        counts
    }

    // ----------------------------------------------------------------
    // 1. Warm start
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn test_first_round_claims_everything() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let client = Arc::new(InMemoryStreamClient::new(4));
        let mut b = balancer(&store, &client, "proc-a", Duration::from_secs(10), None);

        let owned = b.claim_ownership().await.unwrap();
        assert_eq!(owned.len(), 4);

        let counts = owner_counts(&store).await;
        assert_eq!(counts.get("proc-a"), Some(&4));
    }

    #[tokio::test]
    async fn test_timed_out_ownership_is_claimable() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let client = Arc::new(InMemoryStreamClient::new(2));

        // A dead processor claimed everything, then stopped renewing.
        let mut dead = balancer(&store, &client, "proc-dead", Duration::from_millis(50), None);
        assert_eq!(dead.claim_ownership().await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut b = balancer(&store, &client, "proc-a", Duration::from_millis(50), None);
        let owned = b.claim_ownership().await.unwrap();
        assert_eq!(owned.len(), 2, "expired claims are greedily taken over");

        let counts = owner_counts(&store).await;
        assert_eq!(counts.get("proc-a"), Some(&2));
        assert_eq!(counts.get("proc-dead"), None);
    }

    // ----------------------------------------------------------------
    // 2. Steal path
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn test_newcomer_steals_from_richest_owner() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let client = Arc::new(InMemoryStreamClient::new(4));

        let mut a = balancer(&store, &client, "proc-a", Duration::from_secs(10), None);
        assert_eq!(a.claim_ownership().await.unwrap().len(), 4);

        // Everything is freshly owned, so the newcomer's only move is a
        // steal, and only one per round.
        let mut b = balancer(&store, &client, "proc-b", Duration::from_secs(10), None);
        let owned = b.claim_ownership().await.unwrap();
        assert_eq!(owned.len(), 1);

        let counts = owner_counts(&store).await;
        assert_eq!(counts.get("proc-a"), Some(&3));
        assert_eq!(counts.get("proc-b"), Some(&1));
    }

    // ----------------------------------------------------------------
    // 3. Convergence
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn test_two_balancers_converge_to_even_split() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let client = Arc::new(InMemoryStreamClient::new(4));

        let mut a = balancer(&store, &client, "proc-a", Duration::from_secs(10), None);
        let mut b = balancer(&store, &client, "proc-b", Duration::from_secs(10), None);

        let mut a_owned = Vec::new();
        let mut b_owned = Vec::new();
        for _ in 0..10 {
            a_owned = a.claim_ownership().await.unwrap();
            b_owned = b.claim_ownership().await.unwrap();
            if a_owned.len() == 2 && b_owned.len() == 2 {
                break;
            }
        }

        assert_eq!(a_owned.len(), 2, "proc-a should settle at floor(4/2)");
        assert_eq!(b_owned.len(), 2, "proc-b should settle at floor(4/2)");

        // Union covers every partition exactly once.
        let mut union: Vec<String> = a_owned.into_iter().chain(b_owned).collect();
        union.sort();
        assert_eq!(union, vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_settled_owner_only_renews() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let client = Arc::new(InMemoryStreamClient::new(3));

        let mut a = balancer(&store, &client, "proc-a", Duration::from_secs(10), None);
        a.claim_ownership().await.unwrap();

        let before = store
            .list_ownership("ns1", "orders", "$default")
            .await
            .unwrap();

        // Another round renews all three: same owner, rotated tokens.
        let owned = a.claim_ownership().await.unwrap();
        assert_eq!(owned.len(), 3);

        let after = store
            .list_ownership("ns1", "orders", "$default")
            .await
            .unwrap();
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(new.owner_id, "proc-a");
            assert_ne!(old.version_token, new.version_token);
        }
    }

    // ----------------------------------------------------------------
    // 4. Pinned partition mode
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn test_pinned_partition_skips_balancing() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let client = Arc::new(InMemoryStreamClient::new(3));
        let mut b = balancer(
            &store,
            &client,
            "proc-a",
            Duration::from_secs(10),
            Some("1".to_string()),
        );

        let owned = b.claim_ownership().await.unwrap();
        assert_eq!(owned, vec!["1".to_string()]);

        // No ownership rows are written in pinned mode.
        let snapshot = store
            .list_ownership("ns1", "orders", "$default")
            .await
            .unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_pinned_partition_missing_is_fatal() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let client = Arc::new(InMemoryStreamClient::new(3));
        let mut b = balancer(
            &store,
            &client,
            "proc-a",
            Duration::from_secs(10),
            Some("9".to_string()),
        );

        match b.claim_ownership().await {
            Err(ProcessorError::InvalidPartition {
                partition_id,
                available,
            }) => {
                assert_eq!(partition_id, "9");
                assert_eq!(available.len(), 3);
            }
            other => panic!("expected InvalidPartition, got {:?}", other),
        }
    }

    // ----------------------------------------------------------------
    // 5. Fair-share floor
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn test_surplus_owner_claims_nothing() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let client = Arc::new(InMemoryStreamClient::new(1));

        let mut a = balancer(&store, &client, "proc-a", Duration::from_secs(10), None);
        let mut b = balancer(&store, &client, "proc-b", Duration::from_secs(10), None);

        let a_owned = a.claim_ownership().await.unwrap();
        assert_eq!(a_owned.len(), 1);

        // One partition, two owners: proc-b's fair share floors to zero,
        // so it claims nothing and reports owning nothing.
        let b_owned = b.claim_ownership().await.unwrap();
        assert!(b_owned.is_empty());
    }
}
