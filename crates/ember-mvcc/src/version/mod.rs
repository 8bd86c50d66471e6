//! Version chain storage and management.
//!
//! Each logical row maps to a chain of immutable versions, newest first.
//! A version is tagged with:
//! - `xmin`: the transaction that created it
//! - `commit_ts`: stamped when that transaction commits (absent in flight)
//! - `xmax`: the transaction (and its commit timestamp) that superseded or
//!   deleted it (absent while the version is current)
//!
//! # Chain Structure
//!
//! ```text
//! Row key: "user:1"
//! ┌─────────────────────────────────────────────┐
//! │ Version 3 (staged)                          │
//! │ xmin: txn 7, commit_ts: -, xmax: -          │
//! │                     ↓                       │
//! │ Version 2 (current)                         │
//! │ xmin: txn 4, commit_ts: 9, xmax: -          │
//! │                     ↓                       │
//! │ Version 1                                   │
//! │ xmin: txn 1, commit_ts: 3, xmax: (4, 9)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Invariant: at most one committed version per chain has `xmax` absent at
//! any instant. Staged versions from in-flight transactions may coexist
//! with it; first committer wins, the rest conflict-abort.
//!
//! Chain interiors update under a per-chain `RwLock` write guard, so a
//! reader holding the read guard never observes a half-updated chain.
//! Writers are serialized per key by the lock manager, never here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use bytes::Bytes;
use dashmap::DashMap;
use ember_common::types::{CommitTs, RowKey, TxnId};
use parking_lot::RwLock;

use crate::error::{ConflictError, MvccResult};
use crate::snapshot::Snapshot;

/// Records which transaction superseded a version, and when it committed.
///
/// `xmax` is stamped during [`VersionStore::finalize_commit`] of the
/// superseding transaction, so the commit timestamp is always known here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionEnd {
    /// The superseding/deleting transaction.
    pub txn_id: TxnId,
    /// Its commit timestamp.
    pub commit_ts: CommitTs,
}

impl VersionEnd {
    /// Creates a new version end marker.
    pub fn new(txn_id: TxnId, commit_ts: CommitTs) -> Self {
        Self { txn_id, commit_ts }
    }
}

/// A single version of a row.
#[derive(Debug, Clone)]
pub struct Version {
    /// The payload; `None` is a tombstone (the row was deleted).
    pub payload: Option<Bytes>,
    /// The transaction that created this version.
    pub xmin: TxnId,
    /// Commit timestamp of `xmin`; absent while the creator is in flight.
    pub commit_ts: Option<CommitTs>,
    /// Set once a later transaction superseding this version commits.
    pub xmax: Option<VersionEnd>,
}

impl Version {
    /// Creates a staged (uncommitted) version.
    pub fn staged(xmin: TxnId, payload: Option<Bytes>) -> Self {
        Self {
            payload,
            xmin,
            commit_ts: None,
            xmax: None,
        }
    }

    /// Returns true once the creating transaction has committed.
    pub fn is_committed(&self) -> bool {
        self.commit_ts.is_some()
    }

    /// Returns true if this is the current committed version of its chain.
    pub fn is_current(&self) -> bool {
        self.is_committed() && self.xmax.is_none()
    }

    /// Returns true if this version is a delete tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

/// A chain of versions for one row, newest first.
#[derive(Debug)]
pub struct VersionChain {
    key: RowKey,
    versions: RwLock<Vec<Version>>,
}

impl VersionChain {
    /// Creates an empty chain for `key`.
    pub fn new(key: RowKey) -> Self {
        Self {
            key,
            versions: RwLock::new(Vec::new()),
        }
    }

    /// Returns the chain's row key.
    pub fn key(&self) -> &RowKey {
        &self.key
    }

    /// Returns the number of versions in the chain.
    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    /// Returns true if the chain holds no versions.
    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }

    /// Stages a new uncommitted version at the front of the chain.
    ///
    /// Fails with [`ConflictError::WriteWrite`] if a version committed
    /// after `snapshot` already exists: first committer wins, and this
    /// writer lost.
    pub fn stage(&self, snapshot: &Snapshot, payload: Option<Bytes>) -> MvccResult<()> {
        let mut versions = self.versions.write();

        if let Some(ts) = newest_committed_ts(&versions) {
            if ts > snapshot.read_ts() {
                return Err(ConflictError::WriteWrite {
                    key: self.key.clone(),
                    committed_ts: ts,
                    snapshot: snapshot.read_ts(),
                });
            }
        }

        // A transaction re-writing the same key replaces its staged
        // version; each chain holds at most one staged version per txn.
        if let Some(v) = versions
            .iter_mut()
            .find(|v| v.xmin == snapshot.txn_id() && !v.is_committed())
        {
            v.payload = payload;
            return Ok(());
        }

        versions.insert(0, Version::staged(snapshot.txn_id(), payload));
        Ok(())
    }

    /// Returns the visible version for a snapshot, if any.
    pub fn visible(&self, snapshot: &Snapshot) -> Option<Version> {
        let versions = self.versions.read();
        versions.iter().find(|v| snapshot.is_visible(v)).cloned()
    }

    /// Commits `txn_id`'s staged version at `commit_ts`.
    ///
    /// Stamps the staged version's commit timestamp and marks the prior
    /// current version (if any) as superseded. Both updates happen under
    /// one write guard: readers see either the old chain or the new one.
    pub fn commit(&self, txn_id: TxnId, commit_ts: CommitTs) -> bool {
        let mut versions = self.versions.write();

        let staged = versions
            .iter()
            .position(|v| v.xmin == txn_id && !v.is_committed());
        let Some(staged_idx) = staged else {
            return false;
        };

        for (idx, v) in versions.iter_mut().enumerate() {
            if idx != staged_idx && v.is_current() {
                v.xmax = Some(VersionEnd::new(txn_id, commit_ts));
            }
        }
        versions[staged_idx].commit_ts = Some(commit_ts);
        true
    }

    /// Discards `txn_id`'s staged versions.
    pub fn abort(&self, txn_id: TxnId) -> usize {
        let mut versions = self.versions.write();
        let before = versions.len();
        versions.retain(|v| !(v.xmin == txn_id && !v.is_committed()));
        before - versions.len()
    }

    /// Removes versions no snapshot at or above `oldest_active` can see.
    ///
    /// A version is reclaimable once it has been superseded and the
    /// superseding commit is older than every active snapshot. Staged and
    /// current versions are never touched.
    pub fn gc(&self, oldest_active: CommitTs) -> usize {
        let mut versions = self.versions.write();
        let before = versions.len();
        versions.retain(|v| match &v.xmax {
            Some(end) => end.commit_ts >= oldest_active,
            None => true,
        });
        before - versions.len()
    }

    /// Returns all versions, newest first (tests and debugging).
    pub fn all_versions(&self) -> Vec<Version> {
        self.versions.read().clone()
    }
}

fn newest_committed_ts(versions: &[Version]) -> Option<CommitTs> {
    versions.iter().filter_map(|v| v.commit_ts).max()
}

/// Store of version chains, one per row key.
///
/// The chain index is a [`DashMap`], so readers of different keys never
/// contend; per-chain mutation is guarded by the chain's own lock.
#[derive(Debug)]
pub struct VersionStore {
    chains: DashMap<RowKey, Arc<VersionChain>>,
    staged_writes: AtomicU64,
}

impl VersionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
            staged_writes: AtomicU64::new(0),
        }
    }

    /// Returns the number of keys with at least one version.
    pub fn key_count(&self) -> usize {
        self.chains.len()
    }

    /// Total staged writes since creation (monitoring).
    pub fn staged_write_count(&self) -> u64 {
        self.staged_writes.load(AtomicOrdering::Relaxed)
    }

    fn get_or_create_chain(&self, key: &RowKey) -> Arc<VersionChain> {
        self.chains
            .entry(key.clone())
            .or_insert_with(|| Arc::new(VersionChain::new(key.clone())))
            .clone()
    }

    /// Returns the chain for `key` if one exists.
    pub fn get_chain(&self, key: &RowKey) -> Option<Arc<VersionChain>> {
        self.chains.get(key).map(|r| r.clone())
    }

    /// Stages a new version of `key` for the snapshot's transaction.
    ///
    /// The caller must already hold the exclusive row lock; the version
    /// store only enforces first-committer-wins against versions committed
    /// after the snapshot.
    pub fn stage_write(&self, snapshot: &Snapshot, key: &RowKey, payload: Bytes) -> MvccResult<()> {
        let chain = self.get_or_create_chain(key);
        chain.stage(snapshot, Some(payload))?;
        self.staged_writes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Stages a delete tombstone for `key`.
    ///
    /// Returns `Ok(false)` if the snapshot sees no live version to delete
    /// (nothing is staged in that case).
    pub fn stage_delete(&self, snapshot: &Snapshot, key: &RowKey) -> MvccResult<bool> {
        let Some(chain) = self.get_chain(key) else {
            return Ok(false);
        };
        match chain.visible(snapshot) {
            Some(v) if !v.is_tombstone() => {
                chain.stage(snapshot, None)?;
                self.staged_writes.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Reads the payload of `key` visible to `snapshot`.
    ///
    /// Never blocks on row locks; a visible tombstone reads as absence.
    pub fn read(&self, snapshot: &Snapshot, key: &RowKey) -> Option<Bytes> {
        let chain = self.get_chain(key)?;
        chain.visible(snapshot).and_then(|v| v.payload)
    }

    /// Stamps `commit_ts` on every staged version of `txn_id` in `keys`
    /// and supersedes the prior current versions.
    pub fn finalize_commit(&self, txn_id: TxnId, keys: &[RowKey], commit_ts: CommitTs) {
        for key in keys {
            if let Some(chain) = self.get_chain(key) {
                chain.commit(txn_id, commit_ts);
            }
        }
    }

    /// Discards every staged version of `txn_id` in `keys`.
    pub fn finalize_abort(&self, txn_id: TxnId, keys: &[RowKey]) {
        for key in keys {
            if let Some(chain) = self.get_chain(key) {
                chain.abort(txn_id);
            }
        }
    }

    /// Removes versions invisible to every snapshot at or above
    /// `oldest_active`. Returns the number of versions collected.
    pub fn garbage_collect(&self, oldest_active: CommitTs) -> usize {
        let mut total = 0;
        for chain in self.chains.iter() {
            total += chain.gc(oldest_active);
        }
        total
    }

    /// Drops chains left with no versions. Returns how many were removed.
    pub fn prune_empty_chains(&self) -> usize {
        let mut removed = 0;
        self.chains.retain(|_, chain| {
            if chain.is_empty() {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(txn: u64, ts: u64) -> Snapshot {
        Snapshot::new(TxnId::new(txn), CommitTs::new(ts))
    }

    fn key(s: &str) -> RowKey {
        RowKey::from_str(s)
    }

    #[test]
    fn test_stage_and_commit_visible_after() {
        let store = VersionStore::new();
        let k = key("x");

        store
            .stage_write(&snap(1, 0), &k, Bytes::from("1"))
            .unwrap();
        store.finalize_commit(TxnId::new(1), &[k.clone()], CommitTs::new(5));

        // Snapshot taken before the commit sees nothing.
        assert_eq!(store.read(&snap(2, 4), &k), None);
        // Snapshot at or after the commit sees the value.
        assert_eq!(store.read(&snap(3, 5), &k), Some(Bytes::from("1")));
    }

    #[test]
    fn test_own_staged_write_visible() {
        let store = VersionStore::new();
        let k = key("x");
        let s = snap(1, 0);

        store.stage_write(&s, &k, Bytes::from("mine")).unwrap();
        assert_eq!(store.read(&s, &k), Some(Bytes::from("mine")));
        // Other transactions do not see it.
        assert_eq!(store.read(&snap(2, 0), &k), None);
    }

    #[test]
    fn test_first_committer_wins() {
        let store = VersionStore::new();
        let k = key("x");

        // Txn 1 commits at ts=5.
        store
            .stage_write(&snap(1, 0), &k, Bytes::from("a"))
            .unwrap();
        store.finalize_commit(TxnId::new(1), &[k.clone()], CommitTs::new(5));

        // Txn 2 began with snapshot 4: its write must conflict.
        let err = store
            .stage_write(&snap(2, 4), &k, Bytes::from("b"))
            .unwrap_err();
        assert!(matches!(err, ConflictError::WriteWrite { .. }));

        // A snapshot taken after the commit writes fine.
        store
            .stage_write(&snap(3, 5), &k, Bytes::from("c"))
            .unwrap();
    }

    #[test]
    fn test_supersede_stamps_xmax() {
        let store = VersionStore::new();
        let k = key("x");

        store
            .stage_write(&snap(1, 0), &k, Bytes::from("old"))
            .unwrap();
        store.finalize_commit(TxnId::new(1), &[k.clone()], CommitTs::new(1));

        store
            .stage_write(&snap(2, 1), &k, Bytes::from("new"))
            .unwrap();
        store.finalize_commit(TxnId::new(2), &[k.clone()], CommitTs::new(2));

        // Old snapshot still reads the old value; new snapshot the new one.
        assert_eq!(store.read(&snap(5, 1), &k), Some(Bytes::from("old")));
        assert_eq!(store.read(&snap(6, 2), &k), Some(Bytes::from("new")));

        // Exactly one current version.
        let chain = store.get_chain(&k).unwrap();
        let current: Vec<_> = chain
            .all_versions()
            .into_iter()
            .filter(|v| v.is_current())
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].xmin, TxnId::new(2));
    }

    #[test]
    fn test_abort_discards_staged() {
        let store = VersionStore::new();
        let k = key("x");
        let s = snap(1, 0);

        store.stage_write(&s, &k, Bytes::from("gone")).unwrap();
        store.finalize_abort(TxnId::new(1), &[k.clone()]);

        assert_eq!(store.read(&s, &k), None);
        assert_eq!(store.get_chain(&k).unwrap().len(), 0);
    }

    #[test]
    fn test_delete_tombstone() {
        let store = VersionStore::new();
        let k = key("x");

        store
            .stage_write(&snap(1, 0), &k, Bytes::from("v"))
            .unwrap();
        store.finalize_commit(TxnId::new(1), &[k.clone()], CommitTs::new(1));

        // Delete it in txn 2.
        let s2 = snap(2, 1);
        assert!(store.stage_delete(&s2, &k).unwrap());
        store.finalize_commit(TxnId::new(2), &[k.clone()], CommitTs::new(2));

        // Pre-delete snapshot still sees the row; post-delete does not.
        assert_eq!(store.read(&snap(3, 1), &k), Some(Bytes::from("v")));
        assert_eq!(store.read(&snap(4, 2), &k), None);
    }

    #[test]
    fn test_delete_missing_row_is_noop() {
        let store = VersionStore::new();
        assert!(!store.stage_delete(&snap(1, 0), &key("nope")).unwrap());
    }

    #[test]
    fn test_gc_respects_oldest_snapshot() {
        let store = VersionStore::new();
        let k = key("x");

        store
            .stage_write(&snap(1, 0), &k, Bytes::from("v1"))
            .unwrap();
        store.finalize_commit(TxnId::new(1), &[k.clone()], CommitTs::new(1));
        store
            .stage_write(&snap(2, 1), &k, Bytes::from("v2"))
            .unwrap();
        store.finalize_commit(TxnId::new(2), &[k.clone()], CommitTs::new(2));

        // An active snapshot at ts=1 still needs v1 (superseded at ts=2).
        assert_eq!(store.garbage_collect(CommitTs::new(2)), 0);
        assert_eq!(store.read(&snap(9, 1), &k), Some(Bytes::from("v1")));

        // Once the oldest snapshot moves past the supersede, v1 goes.
        assert_eq!(store.garbage_collect(CommitTs::new(3)), 1);
        assert_eq!(store.get_chain(&k).unwrap().len(), 1);
        assert_eq!(store.read(&snap(10, 2), &k), Some(Bytes::from("v2")));
    }

    #[test]
    fn test_gc_never_touches_staged_or_current() {
        let store = VersionStore::new();
        let k = key("x");

        store
            .stage_write(&snap(1, 0), &k, Bytes::from("v"))
            .unwrap();
        store.finalize_commit(TxnId::new(1), &[k.clone()], CommitTs::new(1));
        store
            .stage_write(&snap(2, 1), &k, Bytes::from("staged"))
            .unwrap();

        assert_eq!(store.garbage_collect(CommitTs::MAX), 0);
        assert_eq!(store.get_chain(&k).unwrap().len(), 2);
    }

    #[test]
    fn test_prune_empty_chains() {
        let store = VersionStore::new();
        let k = key("x");
        let s = snap(1, 0);

        store.stage_write(&s, &k, Bytes::from("v")).unwrap();
        store.finalize_abort(TxnId::new(1), &[k.clone()]);

        assert_eq!(store.key_count(), 1);
        assert_eq!(store.prune_empty_chains(), 1);
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_concurrent_readers_during_commit() {
        use std::sync::Arc;

        let store = Arc::new(VersionStore::new());
        let k = key("x");
        store
            .stage_write(&snap(1, 0), &k, Bytes::from("old"))
            .unwrap();
        store.finalize_commit(TxnId::new(1), &[k.clone()], CommitTs::new(1));
        store
            .stage_write(&snap(2, 1), &k, Bytes::from("new"))
            .unwrap();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let k = k.clone();
            readers.push(std::thread::spawn(move || {
                // Snapshot at ts=1: must read "old" before, during and
                // after the concurrent commit of txn 2.
                for _ in 0..500 {
                    assert_eq!(store.read(&snap(9, 1), &k), Some(Bytes::from("old")));
                }
            }));
        }

        store.finalize_commit(TxnId::new(2), &[k.clone()], CommitTs::new(2));
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.read(&snap(10, 2), &k), Some(Bytes::from("new")));
    }
}
