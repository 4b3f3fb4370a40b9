//! Partition Context
//!
//! The per-partition handle exposed to user callbacks. One context exists
//! per partition per processor lifetime: it is created the first time the
//! processor claims the partition, reused across ownership renewals, and
//! dropped when the owning task exits. The ownership row in the store
//! outlives it.

use crate::consumer::{Event, LastEnqueuedInfo};
use crate::error::Result;
use std::sync::{Arc, RwLock};
use streamlease_store::{now_ms, CheckpointRecord, CheckpointStore};
use tracing::{debug, warn};

/// Per-partition handle wrapping checkpoint writes and last-observed-event
/// diagnostics for one partition.
pub struct PartitionContext {
    namespace: String,
    stream: String,
    consumer_group: String,
    partition_id: String,
    store: Option<Arc<dyn CheckpointStore>>,
    last_enqueued: RwLock<Option<LastEnqueuedInfo>>,
}

impl PartitionContext {
    pub(crate) fn new(
        namespace: String,
        stream: String,
        consumer_group: String,
        partition_id: String,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        Self {
            namespace,
            stream,
            consumer_group,
            partition_id,
            store,
            last_enqueued: RwLock::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Durably record this event as processed.
    ///
    /// A checkpoint for event N means every event up to and including N
    /// was handed to the user callback: delivery is at-least-once, and a
    /// crash between handler invocation and checkpoint write redelivers.
    ///
    /// When no store is configured the call logs and succeeds; checkpoints
    /// are an opt-in facility, not a processing requirement.
    pub async fn update_checkpoint(&self, event: &Event) -> Result<()> {
        let Some(store) = &self.store else {
            warn!(
                partition_id = %self.partition_id,
                "No checkpoint store configured, skipping checkpoint"
            );
            return Ok(());
        };

        store
            .update_checkpoint(CheckpointRecord {
                namespace: self.namespace.clone(),
                stream: self.stream.clone(),
                consumer_group: self.consumer_group.clone(),
                partition_id: self.partition_id.clone(),
                offset: event.offset.clone(),
                sequence_number: event.sequence_number,
            })
            .await?;

        debug!(
            partition_id = %self.partition_id,
            offset = %event.offset,
            sequence_number = event.sequence_number,
            "Checkpoint updated"
        );

        Ok(())
    }

    /// Snapshot of the most recently observed event's position.
    ///
    /// `None` unless the processor was configured with
    /// `track_last_enqueued` and at least one event has arrived.
    pub fn last_enqueued(&self) -> Option<LastEnqueuedInfo> {
        self.last_enqueued.read().expect("lock poisoned").clone()
    }

    pub(crate) fn record_last_enqueued(&self, event: &Event) {
        let mut slot = self.last_enqueued.write().expect("lock poisoned");
        *slot = Some(LastEnqueuedInfo {
            offset: event.offset.clone(),
            sequence_number: event.sequence_number,
            enqueued_time_ms: event.enqueued_time_ms,
            retrieval_time_ms: now_ms(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;
    use streamlease_store::InMemoryCheckpointStore;

    fn event(offset: &str, sequence: i64) -> Event {
        Event {
            body: Bytes::from_static(b"payload"),
            offset: offset.to_string(),
            sequence_number: sequence,
            enqueued_time_ms: now_ms(),
            partition_key: None,
            properties: HashMap::new(),
        }
    }

    fn context(store: Option<Arc<dyn CheckpointStore>>) -> PartitionContext {
        PartitionContext::new(
            "ns1".to_string(),
            "orders".to_string(),
            "$default".to_string(),
            "0".to_string(),
            store,
        )
    }

    #[tokio::test]
    async fn test_update_checkpoint_writes_through() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let ctx = context(Some(store.clone() as Arc<dyn CheckpointStore>));

        ctx.update_checkpoint(&event("17", 17)).await.unwrap();

        let checkpoints = store
            .list_checkpoints("ns1", "orders", "$default")
            .await
            .unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].offset, "17");
        assert_eq!(checkpoints[0].sequence_number, 17);
    }

    #[tokio::test]
    async fn test_update_checkpoint_without_store_is_logged_not_raised() {
        let ctx = context(None);
        ctx.update_checkpoint(&event("1", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_last_enqueued_snapshot() {
        let ctx = context(None);
        assert!(ctx.last_enqueued().is_none());

        ctx.record_last_enqueued(&event("5", 5));
        let info = ctx.last_enqueued().unwrap();
        assert_eq!(info.offset, "5");
        assert_eq!(info.sequence_number, 5);
        assert!(info.retrieval_time_ms > 0);
    }
}
