//! Record Type Definitions
//!
//! This module defines the two durable record types shared by every store
//! backend.
//!
//! ## Types Overview
//!
//! ### OwnershipRecord
//! A claim, with expiry-by-timeout semantics, that one processor instance
//! currently owns a partition. Keyed by (namespace, stream, consumer group,
//! partition). The `version_token` enables optimistic-concurrency updates:
//! an update only succeeds when the caller presents the token currently
//! stored, and the store assigns a fresh token on every successful write.
//!
//! ### CheckpointRecord
//! A durable marker of last-processed position for a partition within a
//! consumer group. Checkpoints are fully independent of ownership: a
//! checkpoint survives ownership changes, and an upsert always replaces the
//! prior row ("latest wins").
//!
//! ## Design Decisions
//!
//! - All types are Serialize/Deserialize for storage and diagnostics
//! - Timestamps are i64 (milliseconds since epoch) for simplicity
//! - Offsets are opaque strings; `sequence_number` is a best-effort
//!   monotonically increasing ordering hint

use serde::{Deserialize, Serialize};

/// A claim over one partition by one processor instance.
///
/// At most one ownership record exists per
/// (namespace, stream, consumer_group, partition_id). Two consumer groups
/// never share ownership state, even over the same stream.
///
/// # Fields
///
/// * `namespace` - Hosting namespace of the stream
/// * `stream` - Stream name
/// * `consumer_group` - Consumer group this claim belongs to
/// * `partition_id` - Partition being claimed
/// * `owner_id` - Opaque identity of the claiming processor instance
/// * `last_modified_ms` - Wall-clock timestamp of the last successful
///   claim or renewal (milliseconds since Unix epoch)
/// * `version_token` - Opaque concurrency token (etag). `None` on a first
///   insert; required equal-match when updating an existing row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    /// Hosting namespace of the stream
    pub namespace: String,

    /// Stream name
    pub stream: String,

    /// Consumer group this claim belongs to
    pub consumer_group: String,

    /// Partition being claimed
    pub partition_id: String,

    /// Identity of the claiming processor instance
    pub owner_id: String,

    /// Timestamp of the last successful claim/renewal (ms since epoch)
    pub last_modified_ms: i64,

    /// Optimistic-concurrency token; None on first insert
    pub version_token: Option<String>,
}

impl OwnershipRecord {
    /// Whether this ownership has gone unrenewed for at least
    /// `timeout_ms` as of `now_ms` and is therefore claimable by anyone.
    pub fn is_expired(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms - self.last_modified_ms >= timeout_ms
    }
}

/// Durable read-progress marker for one partition within a consumer group.
///
/// Shares the ownership composite key but is stored and updated
/// independently: checkpoints persist across ownership changes and never
/// require a prior ownership claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Hosting namespace of the stream
    pub namespace: String,

    /// Stream name
    pub stream: String,

    /// Consumer group this checkpoint belongs to
    pub consumer_group: String,

    /// Partition the checkpoint applies to
    pub partition_id: String,

    /// Opaque position marker of the last processed event
    pub offset: String,

    /// Monotonically increasing ordering hint for the last processed event
    pub sequence_number: i64,
}

/// Get current timestamp in milliseconds since epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("System time before UNIX epoch")
        .as_millis() as i64
}
