//! Stream Consumer Capability
//!
//! The processor never talks to the messaging transport directly. It
//! depends on two narrow traits supplied by an external messaging client:
//!
//! - [`StreamClient`]: knows the stream's partition ids and can open a
//!   subscription against one partition at a starting position
//! - [`StreamConsumer`]: an open subscription that yields events until it
//!   is closed or fails terminally
//!
//! Connection management, authentication, retry/backoff around the
//! transport, and outbound batching all live behind this seam and are out
//! of scope here. Failures surface through the small [`ConsumerError`]
//! taxonomy, which the processor maps to either an ownership-lost shutdown
//! of the partition task or a plain error callback.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// One event received from a partition.
///
/// `offset` is an opaque position marker understood by the stream backend;
/// `sequence_number` is a monotonically increasing ordering hint within
/// the partition. Both feed checkpointing.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event payload
    pub body: Bytes,

    /// Opaque position marker within the partition
    pub offset: String,

    /// Monotonically increasing ordering hint within the partition
    pub sequence_number: i64,

    /// When the event was enqueued (ms since epoch)
    pub enqueued_time_ms: i64,

    /// Optional producer-supplied partition key
    pub partition_key: Option<String>,

    /// Application properties attached by the producer
    pub properties: HashMap<String, String>,
}

/// Diagnostic snapshot of the newest event known to exist in a partition.
///
/// Populated on the partition context only when the consumer was opened
/// with `track_last_enqueued` enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastEnqueuedInfo {
    pub offset: String,
    pub sequence_number: i64,
    pub enqueued_time_ms: i64,
    /// When this snapshot was taken (ms since epoch)
    pub retrieval_time_ms: i64,
}

/// Where to begin reading a partition when no checkpoint dictates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartPosition {
    /// Oldest retained event
    Earliest,
    /// Only events enqueued after the consumer opens
    Latest,
    /// Resume after the event with this offset (exclusive)
    Offset(String),
    /// Resume after the event with this sequence number (exclusive)
    Sequence(i64),
}

/// Options passed through when opening a partition subscription.
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Exclusive-reader priority ("epoch"). When set, the backend may
    /// disconnect lower-level readers of the same partition and group.
    pub owner_level: Option<i64>,

    /// Ask the backend to report last-enqueued event diagnostics.
    pub track_last_enqueued: bool,
}

/// Failure taxonomy reported by stream consumers.
#[derive(Debug, Clone, Error)]
pub enum ConsumerError {
    /// Another reader with a higher owner level took over the partition.
    /// The processor treats this as ownership loss, not a fault.
    #[error("Receiver superseded by a reader with owner level {0}")]
    Superseded(i64),

    /// The subscription was closed underneath the consumer.
    #[error("Consumer closed")]
    Closed,

    /// Terminal transport failure; the partition task shuts down and the
    /// partition is re-claimed on a later balancing round.
    #[error("Terminal consumer failure: {0}")]
    Terminal(String),
}

pub type ConsumerResult<T> = std::result::Result<T, ConsumerError>;

/// An open subscription to one partition.
#[async_trait::async_trait]
pub trait StreamConsumer: Send {
    /// Pull the next batch of events.
    ///
    /// May suspend up to an internal timeout and return an empty batch;
    /// an empty batch is not an error and not end-of-stream.
    async fn receive(&mut self, max_batch: usize) -> ConsumerResult<Vec<Event>>;

    /// Close the subscription. Idempotent.
    async fn close(&mut self);
}

/// Capability to inspect a stream and open per-partition subscriptions.
#[async_trait::async_trait]
pub trait StreamClient: Send + Sync {
    /// All partition ids of the stream. Fetched once per processor
    /// lifetime and cached; partition counts change rarely.
    async fn partition_ids(&self) -> ConsumerResult<Vec<String>>;

    /// Open a subscription against one partition at a starting position.
    async fn open_consumer(
        &self,
        partition_id: &str,
        start: StartPosition,
        options: ConsumerOptions,
    ) -> ConsumerResult<Box<dyn StreamConsumer>>;
}
