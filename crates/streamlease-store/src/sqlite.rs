//! SQLite Checkpoint Store Implementation
//!
//! This module implements the CheckpointStore trait using SQLite as the
//! backend.
//!
//! ## What Does This Do?
//!
//! SqliteCheckpointStore provides persistent, multi-process coordination
//! state for streamlease:
//! - Ownership records with optimistic-concurrency version tokens
//! - Checkpoint records with plain upsert semantics
//!
//! ## Why SQLite?
//!
//! For single-host deployments (several processor processes sharing one
//! database file), SQLite is ideal:
//! - **Zero configuration**: embedded database, no separate server
//! - **ACID transactions**: the conditional UPDATE that implements the
//!   compare-and-swap runs atomically
//! - **Easy migration**: the same two-table layout ports directly to any
//!   relational or conditional-put KV backend
//!
//! ## Usage
//!
//! ### File-Based (Production)
//! ```ignore
//! use streamlease_store::{SqliteCheckpointStore, CheckpointStore};
//!
//! // Creates coordination.db (or opens if exists)
//! let store = SqliteCheckpointStore::new("coordination.db").await?;
//! ```
//!
//! ### In-Memory (Testing)
//! ```ignore
//! let store = SqliteCheckpointStore::new_in_memory().await?;
//! ```
//!
//! ## Implementation Details
//!
//! ### Compare-and-swap
//! Claims are implemented as a conditional UPDATE
//! (`WHERE version_token = ?`) for existing rows and a conflict-ignoring
//! INSERT for new rows. A statement that affects zero rows means the claim
//! lost its race; the record is dropped from the result, never an error.
//!
//! ### Table names
//! Table names are configurable but restricted to alphanumerics and
//! underscore. They cannot be bound as SQL parameters, so the restriction
//! is what prevents injection through configuration.

use crate::{
    error::{Result, StoreError},
    types::{now_ms, CheckpointRecord, OwnershipRecord},
    CheckpointStore,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

/// Configuration for the SQLite backend.
///
/// Both table names default to sensible values and only need overriding
/// when several independent deployments share one database file.
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Table holding ownership records (default: "ownership")
    pub ownership_table: String,

    /// Table holding checkpoint records (default: "checkpoints")
    pub checkpoint_table: String,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            ownership_table: "ownership".to_string(),
            checkpoint_table: "checkpoints".to_string(),
        }
    }
}

/// SQLite-based checkpoint store implementation.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    config: SqliteStoreConfig,
}

impl SqliteCheckpointStore {
    /// Create a new SQLite checkpoint store with default table names.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(path, SqliteStoreConfig::default()).await
    }

    /// Create a new SQLite checkpoint store with custom table names.
    ///
    /// # Errors
    ///
    /// - `InvalidTableName`: a configured table name contains characters
    ///   outside `[A-Za-z0-9_]`
    /// - `Database`: the database could not be opened or initialized
    pub async fn with_config<P: AsRef<Path>>(path: P, config: SqliteStoreConfig) -> Result<Self> {
        validate_table_name(&config.ownership_table)?;
        validate_table_name(&config.checkpoint_table)?;

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
                .map_err(sqlx::Error::from)?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool, config };
        store.init_schema().await?;

        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// Uses a single pooled connection: every connection to
    /// `sqlite::memory:` is a separate database, so the pool must not open
    /// a second one.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self {
            pool,
            config: SqliteStoreConfig::default(),
        };
        store.init_schema().await?;

        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let ownership_ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                namespace TEXT NOT NULL,
                stream TEXT NOT NULL,
                consumer_group TEXT NOT NULL,
                partition_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                last_modified_ms INTEGER NOT NULL,
                version_token TEXT NOT NULL,
                PRIMARY KEY (namespace, stream, consumer_group, partition_id)
            )
            "#,
            self.config.ownership_table
        );

        let checkpoint_ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                namespace TEXT NOT NULL,
                stream TEXT NOT NULL,
                consumer_group TEXT NOT NULL,
                partition_id TEXT NOT NULL,
                "offset" TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                PRIMARY KEY (namespace, stream, consumer_group, partition_id)
            )
            "#,
            self.config.checkpoint_table
        );

        sqlx::query(&ownership_ddl).execute(&self.pool).await?;
        sqlx::query(&checkpoint_ddl).execute(&self.pool).await?;

        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn list_ownership(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> Result<Vec<OwnershipRecord>> {
        let sql = format!(
            "SELECT partition_id, owner_id, last_modified_ms, version_token \
             FROM {} \
             WHERE namespace = ? AND stream = ? AND consumer_group = ? \
             ORDER BY partition_id",
            self.config.ownership_table
        );

        let rows = sqlx::query(&sql)
            .bind(namespace)
            .bind(stream)
            .bind(consumer_group)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| OwnershipRecord {
                namespace: namespace.to_string(),
                stream: stream.to_string(),
                consumer_group: consumer_group.to_string(),
                partition_id: row.get("partition_id"),
                owner_id: row.get("owner_id"),
                last_modified_ms: row.get("last_modified_ms"),
                version_token: Some(row.get("version_token")),
            })
            .collect())
    }

    async fn claim_ownership(
        &self,
        requested: Vec<OwnershipRecord>,
    ) -> Result<Vec<OwnershipRecord>> {
        let mut claimed = Vec::with_capacity(requested.len());

        for record in requested {
            let new_token = Uuid::new_v4().to_string();
            let now = now_ms();

            let persisted = match &record.version_token {
                Some(expected_token) => {
                    // Existing row: conditional update, the CAS step.
                    let sql = format!(
                        "UPDATE {} \
                         SET owner_id = ?, last_modified_ms = ?, version_token = ? \
                         WHERE namespace = ? AND stream = ? AND consumer_group = ? \
                           AND partition_id = ? AND version_token = ?",
                        self.config.ownership_table
                    );

                    sqlx::query(&sql)
                        .bind(&record.owner_id)
                        .bind(now)
                        .bind(&new_token)
                        .bind(&record.namespace)
                        .bind(&record.stream)
                        .bind(&record.consumer_group)
                        .bind(&record.partition_id)
                        .bind(expected_token)
                        .execute(&self.pool)
                        .await?
                        .rows_affected()
                        == 1
                }
                None => {
                    // First claim: insert only if nobody beat us to it.
                    let sql = format!(
                        "INSERT INTO {} \
                         (namespace, stream, consumer_group, partition_id, \
                          owner_id, last_modified_ms, version_token) \
                         VALUES (?, ?, ?, ?, ?, ?, ?) \
                         ON CONFLICT(namespace, stream, consumer_group, partition_id) \
                         DO NOTHING",
                        self.config.ownership_table
                    );

                    sqlx::query(&sql)
                        .bind(&record.namespace)
                        .bind(&record.stream)
                        .bind(&record.consumer_group)
                        .bind(&record.partition_id)
                        .bind(&record.owner_id)
                        .bind(now)
                        .bind(&new_token)
                        .execute(&self.pool)
                        .await?
                        .rows_affected()
                        == 1
                }
            };

            if persisted {
                claimed.push(OwnershipRecord {
                    last_modified_ms: now,
                    version_token: Some(new_token),
                    ..record
                });
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
        let sql = format!(
            "INSERT INTO {} \
             (namespace, stream, consumer_group, partition_id, \"offset\", sequence_number) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(namespace, stream, consumer_group, partition_id) \
             DO UPDATE SET \
                 \"offset\" = excluded.\"offset\", \
                 sequence_number = excluded.sequence_number",
            self.config.checkpoint_table
        );

        sqlx::query(&sql)
            .bind(&checkpoint.namespace)
            .bind(&checkpoint.stream)
            .bind(&checkpoint.consumer_group)
            .bind(&checkpoint.partition_id)
            .bind(&checkpoint.offset)
            .bind(checkpoint.sequence_number)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_checkpoints(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> Result<Vec<CheckpointRecord>> {
        let sql = format!(
            "SELECT partition_id, \"offset\", sequence_number \
             FROM {} \
             WHERE namespace = ? AND stream = ? AND consumer_group = ? \
             ORDER BY partition_id",
            self.config.checkpoint_table
        );

        let rows = sqlx::query(&sql)
            .bind(namespace)
            .bind(stream)
            .bind(consumer_group)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| CheckpointRecord {
                namespace: namespace.to_string(),
                stream: stream.to_string(),
                consumer_group: consumer_group.to_string(),
                partition_id: row.get("partition_id"),
                offset: row.get("offset"),
                sequence_number: row.get("sequence_number"),
            })
            .collect())
    }
}

/// Reject table names that could smuggle SQL through configuration.
fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}
