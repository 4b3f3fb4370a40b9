//! StreamLease Store
//!
//! This crate implements the durable coordination backend for streamlease
//! processors: ownership records (who owns which partition right now) and
//! checkpoint records (how far each consumer group has read).
//!
//! ## Purpose
//!
//! Multiple independent processor instances share one store and use it to
//! coordinate without talking to each other directly:
//! - **Ownership**: claims with expiry-by-timeout semantics, updated with
//!   optimistic concurrency (version tokens) so racing claims resolve to
//!   exactly one winner
//! - **Checkpoints**: durable per-partition read progress, independent of
//!   ownership, so a newly-assigned processor resumes near where the
//!   previous owner left off
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │ Processor A │   │ Processor B │   │ Processor C │
//! └──────┬──────┘   └──────┬──────┘   └──────┬──────┘
//!        │  claim / renew / checkpoint       │
//!        └───────────┬─────────┬─────────────┘
//!                    ▼         ▼
//!              ┌──────────────────────┐
//!              │   CheckpointStore    │ ◄── You are here
//!              │ (SQLite / in-memory) │
//!              └──────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use streamlease_store::{CheckpointStore, SqliteCheckpointStore, OwnershipRecord, now_ms};
//!
//! let store = SqliteCheckpointStore::new("coordination.db").await?;
//!
//! // Claim a partition nobody owns yet
//! let claimed = store
//!     .claim_ownership(vec![OwnershipRecord {
//!         namespace: "ns1".to_string(),
//!         stream: "orders".to_string(),
//!         consumer_group: "$default".to_string(),
//!         partition_id: "0".to_string(),
//!         owner_id: "processor-a".to_string(),
//!         last_modified_ms: now_ms(),
//!         version_token: None,
//!     }])
//!     .await?;
//! assert_eq!(claimed.len(), 1);
//! ```
//!
//! ## Thread Safety
//!
//! All implementations are Send + Sync and are shared across async tasks
//! (and across processes, for the SQLite backend) via
//! `Arc<dyn CheckpointStore>`. Cross-process mutual exclusion for ownership
//! comes from the store's own compare-and-swap semantics; no distributed
//! lock service is involved.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{Result, StoreError};
pub use memory::InMemoryCheckpointStore;
pub use sqlite::{SqliteCheckpointStore, SqliteStoreConfig};
pub use types::{now_ms, CheckpointRecord, OwnershipRecord};

use async_trait::async_trait;

/// Durable store trait - abstracts over coordination backends.
///
/// Any backend with atomic "update row if token matches" semantics can
/// implement this trait (an embedded SQL table, a KV store's conditional
/// put, a blob store's etag-conditional upload, ...).
///
/// ## Implementations
///
/// - [`SqliteCheckpointStore`]: reference backend on an embedded SQLite
///   database
/// - [`InMemoryCheckpointStore`]: process-local backend for tests and demos
///
/// ## Concurrency contract
///
/// `claim_ownership` is the only operation with compare-and-swap semantics;
/// a lost race there is silently dropped from the result, never an error.
/// All other operations are plain reads or last-writer-wins upserts.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// List all ownership records for one (namespace, stream, group) scope.
    ///
    /// Returns every stored record, including expired ones: deciding which
    /// records are stale is the balancer's job, not the store's.
    async fn list_ownership(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> Result<Vec<OwnershipRecord>>;

    /// Attempt to claim (or renew) a batch of ownership records.
    ///
    /// Per-record semantics:
    /// - no row exists and the input has no `version_token`: insert the
    ///   row, assigning a fresh token, and include it in the result
    /// - a row exists and the input's `version_token` equal-matches the
    ///   stored one: update owner, timestamp, and token, and include it
    /// - otherwise: skip the record (lost the race to another processor)
    ///
    /// A lost race is never an error; only genuine I/O failures return
    /// `Err`. The result contains exactly the records that were persisted,
    /// with their new `version_token` and `last_modified_ms` filled in.
    async fn claim_ownership(
        &self,
        requested: Vec<OwnershipRecord>,
    ) -> Result<Vec<OwnershipRecord>>;

    /// Upsert a checkpoint record ("latest wins").
    ///
    /// Checkpoints are independent of ownership: this must succeed even
    /// when no ownership row exists for the partition.
    async fn update_checkpoint(&self, checkpoint: CheckpointRecord) -> Result<()>;

    /// List all checkpoint records for one (namespace, stream, group) scope.
    async fn list_checkpoints(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> Result<Vec<CheckpointRecord>>;
}
