//! Error types for the MVCC layer.

use ember_common::types::{CommitTs, RowKey};
use thiserror::Error;

/// Errors surfaced by the version store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// Another transaction committed a newer version of this key after the
    /// writer's snapshot was taken (first-committer-wins). The caller
    /// should abort and retry the whole transaction.
    #[error("write-write conflict on {key:?}: version committed at {committed_ts} is newer than snapshot {snapshot}")]
    WriteWrite {
        /// The contended row key.
        key: RowKey,
        /// Commit timestamp of the conflicting committed version.
        committed_ts: CommitTs,
        /// The writer's snapshot.
        snapshot: CommitTs,
    },
}

/// Result type alias for MVCC operations.
pub type MvccResult<T> = std::result::Result<T, ConflictError>;
