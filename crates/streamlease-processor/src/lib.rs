//! Streamlease Processor - Cooperative Partitioned Stream Consumption
//!
//! This crate implements the consumer side of streamlease: a fleet of
//! [`EventProcessor`] instances sharing one namespace, stream, consumer
//! group, and [`CheckpointStore`](streamlease_store::CheckpointStore)
//! divides the stream's partitions among themselves with no coordinator
//! and no inter-processor communication. All coordination happens through
//! compare-and-swap writes on ownership records in the store.
//!
//! ## Components
//!
//! - [`EventProcessor`]: the orchestrator; runs the balancing loop and
//!   one task per owned partition
//! - [`OwnershipBalancer`]: decides which partitions to claim each round
//! - [`EventHandler`]: user callbacks (`on_event` plus optional error and
//!   lifecycle hooks)
//! - [`PartitionContext`]: per-partition handle for checkpointing and
//!   diagnostics
//! - [`StreamClient`] / [`StreamConsumer`]: the capability seam to the
//!   messaging transport, with [`InMemoryStreamClient`] as the built-in
//!   process-local implementation
//!
//! ## Guarantees
//!
//! - Within a partition, events reach `on_event` in order, one at a time
//! - Across partitions, processing is concurrent
//! - Delivery is at-least-once; duplicates are possible around crashes
//!   and ownership movement, exactly-once is not offered
//! - Handler errors never take down the processor

pub mod balancer;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod memory;
pub mod processor;

pub use balancer::OwnershipBalancer;
pub use config::{ProcessorConfig, DEFAULT_MAX_BATCH_SIZE, DEFAULT_POLLING_INTERVAL};
pub use consumer::{
    ConsumerError, ConsumerOptions, ConsumerResult, Event, LastEnqueuedInfo, StartPosition,
    StreamClient, StreamConsumer,
};
pub use context::PartitionContext;
pub use error::{ProcessorError, Result};
pub use memory::{InMemoryStreamClient, InMemoryStreamConsumer};
pub use processor::{
    CloseReason, EventHandler, EventProcessor, EventProcessorBuilder, HandlerError, HandlerResult,
};
