//! Error types for the streamlease store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
