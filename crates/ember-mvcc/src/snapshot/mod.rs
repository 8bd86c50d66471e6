//! Snapshot visibility.
//!
//! A snapshot is the commit-timestamp boundary defining what a transaction
//! may see. The visibility rule is exact and is the core algorithm of the
//! MVCC layer:
//!
//! A version V is visible to snapshot S iff
//! `V.commit_ts <= S.read_ts` AND (`V.xmax` is absent OR
//! `V.xmax.commit_ts > S.read_ts`).
//!
//! Additionally a transaction always sees its own staged (uncommitted)
//! writes, and never sees uncommitted writes of other transactions.

use ember_common::types::{CommitTs, TxnId};

use crate::version::Version;

/// A consistent read view, captured at transaction begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    txn_id: TxnId,
    read_ts: CommitTs,
}

impl Snapshot {
    /// Creates a snapshot for a transaction.
    ///
    /// `read_ts` is the highest commit timestamp issued when the
    /// transaction began.
    pub fn new(txn_id: TxnId, read_ts: CommitTs) -> Self {
        Self { txn_id, read_ts }
    }

    /// Creates a read-only snapshot not tied to any transaction.
    pub fn at(read_ts: CommitTs) -> Self {
        Self {
            txn_id: TxnId::INVALID,
            read_ts,
        }
    }

    /// Returns the owning transaction's ID.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Returns the read timestamp.
    pub fn read_ts(&self) -> CommitTs {
        self.read_ts
    }

    /// Checks whether a version is visible in this snapshot.
    pub fn is_visible(&self, version: &Version) -> bool {
        // Own staged or committed writes are always visible.
        if version.xmin == self.txn_id {
            return match &version.xmax {
                // Superseded by a later own write in the same transaction.
                Some(end) => end.txn_id != self.txn_id,
                None => true,
            };
        }

        // Others' writes must be committed at or before the snapshot.
        let committed_at = match version.commit_ts {
            Some(ts) if ts <= self.read_ts => ts,
            _ => return false,
        };
        debug_assert!(committed_at <= self.read_ts);

        // ... and not superseded at or before the snapshot.
        match &version.xmax {
            Some(end) => end.commit_ts > self.read_ts,
            None => true,
        }
    }
}
