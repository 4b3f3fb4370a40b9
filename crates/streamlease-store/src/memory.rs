//! In-Memory Checkpoint Store
//!
//! A process-local CheckpointStore used by tests, demos, and single-process
//! deployments that do not need durability. Implements the exact same
//! compare-and-swap claim semantics as the SQLite backend so balancing
//! behavior can be exercised without a database file.

use crate::{
    error::Result,
    types::{now_ms, CheckpointRecord, OwnershipRecord},
    CheckpointStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

type RecordKey = (String, String, String, String);

fn key_of(namespace: &str, stream: &str, consumer_group: &str, partition_id: &str) -> RecordKey {
    (
        namespace.to_string(),
        stream.to_string(),
        consumer_group.to_string(),
        partition_id.to_string(),
    )
}

/// In-memory checkpoint store backed by two hash maps.
///
/// Safe to share across tasks via `Arc`; a single `RwLock` over the inner
/// maps makes each claim batch atomic with respect to concurrent claimers
/// in the same process.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    ownership: HashMap<RecordKey, OwnershipRecord>,
    checkpoints: HashMap<RecordKey, CheckpointRecord>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list_ownership(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> Result<Vec<OwnershipRecord>> {
        let inner = self.inner.read().await;

        let mut records: Vec<OwnershipRecord> = inner
            .ownership
            .values()
            .filter(|r| {
                r.namespace == namespace
                    && r.stream == stream
                    && r.consumer_group == consumer_group
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));

        Ok(records)
    }

    async fn claim_ownership(
        &self,
        requested: Vec<OwnershipRecord>,
    ) -> Result<Vec<OwnershipRecord>> {
        let mut inner = self.inner.write().await;
        let mut claimed = Vec::with_capacity(requested.len());

        for mut record in requested {
            let key = key_of(
                &record.namespace,
                &record.stream,
                &record.consumer_group,
                &record.partition_id,
            );

            let persisted = match (inner.ownership.get(&key), &record.version_token) {
                // First claim of an unowned partition.
                (None, None) => true,
                // Existing row: token must equal-match.
                (Some(stored), Some(token)) => stored.version_token.as_deref() == Some(token),
                // Row appeared since the claimer's snapshot, or vanished
                // from under a token-carrying update: lost the race.
                _ => false,
            };

            if persisted {
                record.last_modified_ms = now_ms();
                record.version_token = Some(Uuid::new_v4().to_string());
                inner.ownership.insert(key, record.clone());
                claimed.push(record);
            } else {
                debug!(
                    partition_id = %record.partition_id,
                    owner_id = %record.owner_id,
                    "Lost ownership claim race"
                );
            }
        }

        Ok(claimed)
    }

    async fn update_checkpoint(&self, checkpoint: CheckpointRecord) -> Result<()> {
        let key = key_of(
            &checkpoint.namespace,
            &checkpoint.stream,
            &checkpoint.consumer_group,
            &checkpoint.partition_id,
        );

        self.inner.write().await.checkpoints.insert(key, checkpoint);
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> Result<Vec<CheckpointRecord>> {
        let inner = self.inner.read().await;

        let mut records: Vec<CheckpointRecord> = inner
            .checkpoints
            .values()
            .filter(|r| {
                r.namespace == namespace
                    && r.stream == stream
                    && r.consumer_group == consumer_group
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));

        Ok(records)
    }
}
