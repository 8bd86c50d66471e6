//! Commit timestamps and sequencers.
//!
//! Commit timestamps form the single total order of commits in one
//! `TransactionManager` instance. They are allocated from one atomic
//! counter, which is the only hard serialization point in the core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use super::TxnId;

/// A commit timestamp.
///
/// Every committed version carries the `CommitTs` of its creating
/// transaction; a transaction's snapshot is the highest `CommitTs` issued
/// at the moment it began. Visibility is decided purely by comparing
/// these values.
///
/// # Example
///
/// ```rust
/// use ember_common::types::CommitTs;
///
/// assert!(CommitTs::new(4) < CommitTs::new(5));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CommitTs(u64);

impl CommitTs {
    /// The zero timestamp; every snapshot is at least this.
    pub const ZERO: Self = Self(0);

    /// Maximum timestamp value.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a commit timestamp from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CommitTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitTs({})", self.0)
    }
}

impl fmt::Display for CommitTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CommitTs {
    #[inline]
    fn from(ts: u64) -> Self {
        Self::new(ts)
    }
}

impl From<CommitTs> for u64 {
    #[inline]
    fn from(ts: CommitTs) -> Self {
        ts.0
    }
}

/// Allocator for commit timestamps.
///
/// A single increment-only atomic counter: `next` is the one hard
/// serialization point in the whole core and stays O(1) and uncontended.
/// Two transactions committing concurrently are serialized arbitrarily but
/// consistently by this counter.
#[derive(Debug)]
pub struct CommitSequencer {
    last: AtomicU64,
}

impl CommitSequencer {
    /// Creates a sequencer starting at zero (no commits yet).
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Creates a sequencer whose last issued timestamp is `ts`.
    #[must_use]
    pub fn starting_at(ts: CommitTs) -> Self {
        Self {
            last: AtomicU64::new(ts.as_u64()),
        }
    }

    /// Issues the next commit timestamp. Strictly monotonic.
    pub fn next(&self) -> CommitTs {
        CommitTs::new(self.last.fetch_add(1, AtomicOrdering::SeqCst) + 1)
    }

    /// Returns the highest commit timestamp issued so far.
    ///
    /// This is what a beginning transaction captures as its snapshot.
    pub fn current(&self) -> CommitTs {
        CommitTs::new(self.last.load(AtomicOrdering::SeqCst))
    }
}

impl Default for CommitSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator for transaction IDs.
///
/// Strictly increasing, process-wide unique. Deadlock victim selection
/// relies on this ordering: a higher ID means a younger transaction.
#[derive(Debug)]
pub struct TxnIdSequencer {
    next: AtomicU64,
}

impl TxnIdSequencer {
    /// Creates a sequencer issuing IDs from [`TxnId::MIN`] upward.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(TxnId::MIN.as_u64()),
        }
    }

    /// Issues the next transaction ID.
    pub fn next(&self) -> TxnId {
        TxnId::new(self.next.fetch_add(1, AtomicOrdering::SeqCst))
    }
}

impl Default for TxnIdSequencer {
    fn default() -> Self {
        Self::new()
    }
}
