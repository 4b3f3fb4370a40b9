//! In-Memory Stream Client
//!
//! A process-local implementation of the [`StreamClient`] /
//! [`StreamConsumer`] capability, feeding consumers from per-partition
//! append-only logs. Used by the integration tests and demos in place of a
//! real messaging transport.
//!
//! Supports the behaviors the processor depends on:
//! - start positions (earliest, latest, exclusive offset/sequence resume)
//! - blocking receive with an internal timeout (empty batch on timeout)
//! - exclusive-reader owner levels: opening a consumer with an equal or
//!   higher `owner_level` supersedes the previous exclusive reader, whose
//!   next `receive` fails with [`ConsumerError::Superseded`]

use crate::consumer::{
    ConsumerError, ConsumerOptions, ConsumerResult, Event, StartPosition, StreamClient,
    StreamConsumer,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use streamlease_store::now_ms;
use tokio::sync::{Notify, RwLock};

/// How long a receive call waits for new events before returning an empty
/// batch.
const RECEIVE_WAIT: Duration = Duration::from_millis(50);

struct Shared {
    logs: RwLock<HashMap<String, Vec<Event>>>,
    /// partition -> (active generation, owner level of that generation)
    exclusives: RwLock<HashMap<String, (u64, i64)>>,
    notify: Notify,
}

/// In-memory partitioned event stream.
pub struct InMemoryStreamClient {
    partitions: Vec<String>,
    shared: Arc<Shared>,
}

impl InMemoryStreamClient {
    /// Create a stream with `partition_count` partitions named "0".."n-1".
    pub fn new(partition_count: usize) -> Self {
        let partitions: Vec<String> = (0..partition_count).map(|p| p.to_string()).collect();
        let logs = partitions
            .iter()
            .map(|p| (p.clone(), Vec::new()))
            .collect();

        Self {
            partitions,
            shared: Arc::new(Shared {
                logs: RwLock::new(logs),
                exclusives: RwLock::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Append an event to a partition and wake blocked receivers.
    pub async fn push(&self, partition_id: &str, body: impl Into<Bytes>) -> ConsumerResult<()> {
        let mut logs = self.shared.logs.write().await;
        let log = logs
            .get_mut(partition_id)
            .ok_or_else(|| ConsumerError::Terminal(format!("no partition {partition_id}")))?;

        let sequence = log.len() as i64;
        log.push(Event {
            body: body.into(),
            offset: sequence.to_string(),
            sequence_number: sequence,
            enqueued_time_ms: now_ms(),
            partition_key: None,
            properties: HashMap::new(),
        });
        drop(logs);

        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Number of events appended so far to a partition.
    pub async fn event_count(&self, partition_id: &str) -> usize {
        self.shared
            .logs
            .read()
            .await
            .get(partition_id)
            .map(|log| log.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl StreamClient for InMemoryStreamClient {
    async fn partition_ids(&self) -> ConsumerResult<Vec<String>> {
        Ok(self.partitions.clone())
    }

    async fn open_consumer(
        &self,
        partition_id: &str,
        start: StartPosition,
        options: ConsumerOptions,
    ) -> ConsumerResult<Box<dyn StreamConsumer>> {
        let logs = self.shared.logs.read().await;
        let log = logs
            .get(partition_id)
            .ok_or_else(|| ConsumerError::Terminal(format!("no partition {partition_id}")))?;

        let cursor = resolve_cursor(log, &start);
        drop(logs);

        // Exclusive-reader handling: an equal or higher owner level takes
        // over the partition; a lower one is rejected outright.
        let generation = match options.owner_level {
            Some(level) => {
                let mut exclusives = self.shared.exclusives.write().await;
                let entry = exclusives.entry(partition_id.to_string()).or_insert((0, level));
                if level < entry.1 {
                    return Err(ConsumerError::Superseded(entry.1));
                }
                entry.0 += 1;
                entry.1 = level;
                let generation = entry.0;
                drop(exclusives);
                self.shared.notify.notify_waiters();
                Some(generation)
            }
            None => None,
        };

        Ok(Box::new(InMemoryStreamConsumer {
            partition_id: partition_id.to_string(),
            shared: Arc::clone(&self.shared),
            cursor,
            generation,
            closed: false,
        }))
    }
}

fn resolve_cursor(log: &[Event], start: &StartPosition) -> usize {
    match start {
        StartPosition::Earliest => 0,
        StartPosition::Latest => log.len(),
        // Offsets in this client are stringified sequence numbers; resume
        // is exclusive of the given position.
        StartPosition::Offset(offset) => match offset.parse::<i64>() {
            Ok(seq) => after_sequence(log, seq),
            Err(_) => log.len(),
        },
        StartPosition::Sequence(seq) => after_sequence(log, *seq),
    }
}

fn after_sequence(log: &[Event], sequence: i64) -> usize {
    log.iter()
        .position(|e| e.sequence_number > sequence)
        .unwrap_or(log.len())
}

/// Subscription handle over one in-memory partition log.
pub struct InMemoryStreamConsumer {
    partition_id: String,
    shared: Arc<Shared>,
    cursor: usize,
    generation: Option<u64>,
    closed: bool,
}

impl InMemoryStreamConsumer {
    async fn check_exclusive(&self) -> ConsumerResult<()> {
        if let Some(generation) = self.generation {
            let exclusives = self.shared.exclusives.read().await;
            if let Some((active, level)) = exclusives.get(&self.partition_id) {
                if *active != generation {
                    return Err(ConsumerError::Superseded(*level));
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StreamConsumer for InMemoryStreamConsumer {
    async fn receive(&mut self, max_batch: usize) -> ConsumerResult<Vec<Event>> {
        if self.closed {
            return Err(ConsumerError::Closed);
        }
        self.check_exclusive().await?;

        {
            let logs = self.shared.logs.read().await;
            let log = &logs[&self.partition_id];
            if self.cursor < log.len() {
                let end = log.len().min(self.cursor + max_batch.max(1));
                let batch = log[self.cursor..end].to_vec();
                self.cursor = end;
                return Ok(batch);
            }
        }

        // Nothing buffered: wait for a producer or time out empty.
        tokio::select! {
            _ = self.shared.notify.notified() => {}
            _ = tokio::time::sleep(RECEIVE_WAIT) => return Ok(Vec::new()),
        }

        self.check_exclusive().await?;

        let logs = self.shared.logs.read().await;
        let log = &logs[&self.partition_id];
        let end = log.len().min(self.cursor + max_batch.max(1));
        let batch = log[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(batch)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_from_earliest() {
        let client = InMemoryStreamClient::new(1);
        client.push("0", "a").await.unwrap();
        client.push("0", "b").await.unwrap();

        let mut consumer = client
            .open_consumer("0", StartPosition::Earliest, ConsumerOptions::default())
            .await
            .unwrap();

        let batch = consumer.receive(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].sequence_number, 0);
        assert_eq!(batch[1].offset, "1");
    }

    #[tokio::test]
    async fn test_latest_skips_backlog() {
        let client = InMemoryStreamClient::new(1);
        client.push("0", "old").await.unwrap();

        let mut consumer = client
            .open_consumer("0", StartPosition::Latest, ConsumerOptions::default())
            .await
            .unwrap();

        // Backlog invisible; only events pushed after open arrive.
        let empty = consumer.receive(10).await.unwrap();
        assert!(empty.is_empty());

        client.push("0", "new").await.unwrap();
        let batch = consumer.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, Bytes::from("new"));
    }

    #[tokio::test]
    async fn test_offset_resume_is_exclusive() {
        let client = InMemoryStreamClient::new(1);
        for body in ["a", "b", "c"] {
            client.push("0", body).await.unwrap();
        }

        let mut consumer = client
            .open_consumer(
                "0",
                StartPosition::Offset("1".to_string()),
                ConsumerOptions::default(),
            )
            .await
            .unwrap();

        let batch = consumer.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn test_higher_owner_level_supersedes() {
        let client = InMemoryStreamClient::new(1);
        client.push("0", "a").await.unwrap();

        let mut first = client
            .open_consumer(
                "0",
                StartPosition::Earliest,
                ConsumerOptions {
                    owner_level: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.receive(10).await.unwrap().len(), 1);

        let _second = client
            .open_consumer(
                "0",
                StartPosition::Earliest,
                ConsumerOptions {
                    owner_level: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        match first.receive(10).await {
            Err(ConsumerError::Superseded(level)) => assert_eq!(level, 2),
            other => panic!("expected Superseded, got {:?}", other.map(|b| b.len())),
        }
    }

    #[tokio::test]
    async fn test_lower_owner_level_rejected() {
        let client = InMemoryStreamClient::new(1);

        let _high = client
            .open_consumer(
                "0",
                StartPosition::Earliest,
                ConsumerOptions {
                    owner_level: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let low = client
            .open_consumer(
                "0",
                StartPosition::Earliest,
                ConsumerOptions {
                    owner_level: Some(1),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(low, Err(ConsumerError::Superseded(5))));
    }

    #[tokio::test]
    async fn test_closed_consumer_errors() {
        let client = InMemoryStreamClient::new(1);
        let mut consumer = client
            .open_consumer("0", StartPosition::Earliest, ConsumerOptions::default())
            .await
            .unwrap();

        consumer.close().await;
        assert!(matches!(consumer.receive(1).await, Err(ConsumerError::Closed)));
    }
}
