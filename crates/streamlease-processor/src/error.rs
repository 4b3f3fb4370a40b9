//! Error types for the streamlease processor.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessorError>;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Requested partition {partition_id:?} does not exist (available: {available:?})")]
    InvalidPartition {
        partition_id: String,
        available: Vec<String>,
    },

    #[error("Store error: {0}")]
    Store(#[from] streamlease_store::StoreError),

    #[error("Consumer error: {0}")]
    Consumer(#[from] crate::consumer::ConsumerError),

    #[error("Event handler error: {0}")]
    Handler(String),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
