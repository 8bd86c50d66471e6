//! Transaction lifecycle management.
//!
//! The [`TransactionManager`] ties the pieces together: it allocates
//! transaction IDs and snapshots, routes reads and writes through the
//! lock manager and version store, and drives the state machine
//!
//! ```text
//!             ┌─────────► Committed
//!             │
//! Active ──► Preparing ──► Prepared ──► Committed
//!    │            │            │
//!    └────────────┴────────────┴─────► Aborted
//! ```
//!
//! Locking is strict two-phase: every lock a transaction takes is held
//! until it commits or aborts. Writes take Exclusive row locks; under
//! [`IsolationLevel::Serializable`] reads take Shared row locks as well,
//! which closes the write-skew anomaly snapshot isolation permits.
//!
//! When a lock wait fails or a write hits a first-committer-wins
//! conflict, the transaction is aborted immediately and the failure is
//! surfaced as [`TxnError::Aborted`]. Retrying is the caller's decision.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ember_common::types::{CommitSequencer, CommitTs, RowKey, TxnId, TxnIdSequencer};
use ember_mvcc::gc::OldestSnapshot;
use ember_mvcc::snapshot::Snapshot;
use ember_mvcc::version::VersionStore;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::lock::{LockError, LockManager, LockMode};

/// Result type for transaction operations.
pub type TxnResult<T> = std::result::Result<T, TxnError>;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Executing reads and writes.
    Active,
    /// Prepare in progress.
    Preparing,
    /// Voted yes in 2PC; holding locks, awaiting the decision.
    Prepared,
    /// Terminal: all writes visible at the commit timestamp.
    Committed,
    /// Terminal: all writes discarded.
    Aborted,
}

impl TransactionState {
    /// Returns true for the terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Isolation level for new transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Snapshot isolation: consistent reads without read locks.
    #[default]
    Snapshot,
    /// Serializable via S2PL: reads take Shared locks too.
    Serializable,
}

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Explicit abort requested by the caller.
    Requested,
    /// Lost a first-committer-wins write-write conflict.
    Conflict,
    /// Chosen as a deadlock victim.
    Deadlock,
    /// A lock wait timed out.
    Timeout,
    /// A 2PC participant voted no.
    ParticipantVoteNo,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Requested => write!(f, "requested"),
            AbortReason::Conflict => write!(f, "write-write conflict"),
            AbortReason::Deadlock => write!(f, "deadlock victim"),
            AbortReason::Timeout => write!(f, "lock timeout"),
            AbortReason::ParticipantVoteNo => write!(f, "participant voted no"),
        }
    }
}

/// Errors from transaction operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnError {
    /// No transaction with this ID is known.
    #[error("transaction {0} not found")]
    NotFound(TxnId),
    /// The operation is not legal in the transaction's current state.
    #[error("transaction {txn_id} is {state:?}, expected {expected}")]
    InvalidState {
        /// The transaction.
        txn_id: TxnId,
        /// Its actual state.
        state: TransactionState,
        /// The state the operation required.
        expected: &'static str,
    },
    /// The transaction was aborted by this operation or a concurrent one.
    #[error("transaction {txn_id} aborted: {reason}")]
    Aborted {
        /// The transaction.
        txn_id: TxnId,
        /// Why it was aborted.
        reason: AbortReason,
    },
}

/// Per-transaction bookkeeping.
#[derive(Debug)]
struct Transaction {
    snapshot: Snapshot,
    state: TransactionState,
    isolation: IsolationLevel,
    /// Keys this transaction has staged versions for.
    write_set: HashSet<RowKey>,
    abort_reason: Option<AbortReason>,
    commit_ts: Option<CommitTs>,
    prepared_at: Option<Instant>,
}

impl Transaction {
    fn write_keys(&self) -> Vec<RowKey> {
        self.write_set.iter().cloned().collect()
    }
}

/// Configuration for the transaction manager.
#[derive(Debug, Clone)]
pub struct TransactionManagerConfig {
    /// Isolation level applied by [`TransactionManager::begin`].
    pub isolation: IsolationLevel,
    /// Timeout for row-lock waits.
    pub lock_timeout: Duration,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

/// Counters for transaction activity.
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Transactions begun.
    pub begun: AtomicU64,
    /// Transactions committed.
    pub committed: AtomicU64,
    /// Transactions aborted, any reason.
    pub aborted: AtomicU64,
    /// Aborts caused by write-write conflicts.
    pub conflicts: AtomicU64,
    /// Aborts caused by deadlock victimhood.
    pub deadlocks: AtomicU64,
    /// Aborts caused by lock timeouts.
    pub lock_timeouts: AtomicU64,
    /// Transactions that reached Prepared.
    pub prepared: AtomicU64,
}

/// Coordinates transactions over a version store and a lock manager.
pub struct TransactionManager {
    ids: TxnIdSequencer,
    commits: CommitSequencer,
    store: Arc<VersionStore>,
    locks: Arc<LockManager>,
    txns: RwLock<HashMap<TxnId, Mutex<Transaction>>>,
    config: TransactionManagerConfig,
    stats: TransactionStats,
}

impl TransactionManager {
    /// Creates a manager with default configuration.
    pub fn new(store: Arc<VersionStore>, locks: Arc<LockManager>) -> Self {
        Self::with_config(store, locks, TransactionManagerConfig::default())
    }

    /// Creates a manager with custom configuration.
    pub fn with_config(
        store: Arc<VersionStore>,
        locks: Arc<LockManager>,
        config: TransactionManagerConfig,
    ) -> Self {
        Self {
            ids: TxnIdSequencer::new(),
            commits: CommitSequencer::new(),
            store,
            locks,
            txns: RwLock::new(HashMap::new()),
            config,
            stats: TransactionStats::default(),
        }
    }

    /// Returns the lock manager this instance coordinates through.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Returns the version store this instance writes to.
    pub fn version_store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    /// Returns transaction statistics.
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// Begins a transaction at the configured isolation level.
    pub fn begin(&self) -> TxnId {
        self.begin_with_isolation(self.config.isolation)
    }

    /// Begins a transaction at an explicit isolation level.
    ///
    /// The snapshot is the highest commit timestamp issued so far; every
    /// commit at or below it is visible, everything later is not.
    pub fn begin_with_isolation(&self, isolation: IsolationLevel) -> TxnId {
        let txn_id = self.ids.next();
        let snapshot = Snapshot::new(txn_id, self.commits.current());

        self.txns.write().insert(
            txn_id,
            Mutex::new(Transaction {
                snapshot,
                state: TransactionState::Active,
                isolation,
                write_set: HashSet::new(),
                abort_reason: None,
                commit_ts: None,
                prepared_at: None,
            }),
        );
        self.stats.begun.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(txn = txn_id.as_u64(), snapshot = %snapshot.read_ts(), ?isolation, "begin");
        txn_id
    }

    /// Returns a transaction's current state.
    pub fn state(&self, txn_id: TxnId) -> TxnResult<TransactionState> {
        let txns = self.txns.read();
        let txn = txns
            .get(&txn_id)
            .ok_or(TxnError::NotFound(txn_id))?
            .lock();
        Ok(txn.state)
    }

    /// Returns a transaction's snapshot.
    pub fn snapshot(&self, txn_id: TxnId) -> TxnResult<Snapshot> {
        let txns = self.txns.read();
        let txn = txns
            .get(&txn_id)
            .ok_or(TxnError::NotFound(txn_id))?
            .lock();
        Ok(txn.snapshot)
    }

    /// Reads the value of `key` visible to the transaction's snapshot.
    ///
    /// Under [`IsolationLevel::Serializable`] a Shared lock on the key is
    /// taken first and held until commit or abort.
    pub fn read(&self, txn_id: TxnId, key: &RowKey) -> TxnResult<Option<Bytes>> {
        let (snapshot, isolation) = self.check_active(txn_id)?;

        if isolation == IsolationLevel::Serializable {
            self.lock_or_abort(txn_id, key, LockMode::Shared)?;
            // The lock wait may have raced with an abort by the deadlock
            // detector or another thread.
            self.recheck_active(txn_id)?;
        }
        Ok(self.store.read(&snapshot, key))
    }

    /// Writes `payload` as the transaction's staged version of `key`.
    ///
    /// Takes the Exclusive row lock, then stages the version. A lock
    /// failure or a first-committer-wins conflict aborts the transaction
    /// and surfaces as [`TxnError::Aborted`].
    pub fn write(&self, txn_id: TxnId, key: &RowKey, payload: Bytes) -> TxnResult<()> {
        self.check_active(txn_id)?;
        self.lock_or_abort(txn_id, key, LockMode::Exclusive)?;

        let txns = self.txns.read();
        let mut txn = txns
            .get(&txn_id)
            .ok_or(TxnError::NotFound(txn_id))?
            .lock();
        if txn.state != TransactionState::Active {
            // Aborted while we were waiting for the lock.
            let err = self.state_error(txn_id, &txn, "Active");
            drop(txn);
            drop(txns);
            self.locks.release_all(txn_id);
            return Err(err);
        }

        match self.store.stage_write(&txn.snapshot, key, payload) {
            Ok(()) => {
                txn.write_set.insert(key.clone());
                Ok(())
            }
            Err(conflict) => {
                drop(txn);
                drop(txns);
                debug!(txn = txn_id.as_u64(), %conflict, "write conflict");
                self.abort_with(txn_id, AbortReason::Conflict)?;
                Err(TxnError::Aborted {
                    txn_id,
                    reason: AbortReason::Conflict,
                })
            }
        }
    }

    /// Stages a delete tombstone for `key`.
    ///
    /// Returns `Ok(false)` when the snapshot sees no live row to delete.
    /// Locking and conflict handling match [`TransactionManager::write`].
    pub fn delete(&self, txn_id: TxnId, key: &RowKey) -> TxnResult<bool> {
        self.check_active(txn_id)?;
        self.lock_or_abort(txn_id, key, LockMode::Exclusive)?;

        let txns = self.txns.read();
        let mut txn = txns
            .get(&txn_id)
            .ok_or(TxnError::NotFound(txn_id))?
            .lock();
        if txn.state != TransactionState::Active {
            let err = self.state_error(txn_id, &txn, "Active");
            drop(txn);
            drop(txns);
            self.locks.release_all(txn_id);
            return Err(err);
        }

        match self.store.stage_delete(&txn.snapshot, key) {
            Ok(staged) => {
                if staged {
                    txn.write_set.insert(key.clone());
                }
                Ok(staged)
            }
            Err(conflict) => {
                drop(txn);
                drop(txns);
                debug!(txn = txn_id.as_u64(), %conflict, "delete conflict");
                self.abort_with(txn_id, AbortReason::Conflict)?;
                Err(TxnError::Aborted {
                    txn_id,
                    reason: AbortReason::Conflict,
                })
            }
        }
    }

    /// Commits an Active transaction.
    ///
    /// Assigns the commit timestamp, stamps every staged version, then
    /// releases all locks. Returns the commit timestamp.
    pub fn commit(&self, txn_id: TxnId) -> TxnResult<CommitTs> {
        let ts = {
            let txns = self.txns.read();
            let mut txn = txns
                .get(&txn_id)
                .ok_or(TxnError::NotFound(txn_id))?
                .lock();
            if txn.state != TransactionState::Active {
                return Err(self.state_error(txn_id, &txn, "Active"));
            }

            let ts = self.commits.next();
            self.store.finalize_commit(txn_id, &txn.write_keys(), ts);
            txn.state = TransactionState::Committed;
            txn.commit_ts = Some(ts);
            ts
        };

        // Locks release only after the versions are stamped, so the next
        // lock holder observes the committed state.
        self.locks.release_all(txn_id);
        self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(txn = txn_id.as_u64(), commit_ts = %ts, "commit");
        Ok(ts)
    }

    /// Prepares an Active transaction for two-phase commit.
    ///
    /// On return the transaction is Prepared: it holds all its locks and
    /// its staged versions, and can only move to Committed (via
    /// [`TransactionManager::commit_prepared`]) or Aborted.
    pub fn prepare(&self, txn_id: TxnId) -> TxnResult<()> {
        let txns = self.txns.read();
        let mut txn = txns
            .get(&txn_id)
            .ok_or(TxnError::NotFound(txn_id))?
            .lock();
        if txn.state != TransactionState::Active {
            return Err(self.state_error(txn_id, &txn, "Active"));
        }

        txn.state = TransactionState::Preparing;
        // Local prepare has no deferred work; staged versions and locks
        // are already in place. The two-step transition still exists so a
        // crash mid-prepare is distinguishable from a completed one.
        txn.state = TransactionState::Prepared;
        txn.prepared_at = Some(Instant::now());
        self.stats.prepared.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(txn = txn_id.as_u64(), "prepared");
        Ok(())
    }

    /// Commits a Prepared transaction (the 2PC commit decision).
    pub fn commit_prepared(&self, txn_id: TxnId) -> TxnResult<CommitTs> {
        let ts = {
            let txns = self.txns.read();
            let mut txn = txns
                .get(&txn_id)
                .ok_or(TxnError::NotFound(txn_id))?
                .lock();
            if txn.state != TransactionState::Prepared {
                return Err(self.state_error(txn_id, &txn, "Prepared"));
            }

            let ts = self.commits.next();
            self.store.finalize_commit(txn_id, &txn.write_keys(), ts);
            txn.state = TransactionState::Committed;
            txn.commit_ts = Some(ts);
            ts
        };

        self.locks.release_all(txn_id);
        self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(txn = txn_id.as_u64(), commit_ts = %ts, "commit prepared");
        Ok(ts)
    }

    /// Aborts a transaction: discards its staged versions and releases
    /// its locks. Legal from Active, Preparing or Prepared; aborting an
    /// already-aborted transaction is a no-op.
    pub fn abort(&self, txn_id: TxnId) -> TxnResult<()> {
        self.abort_with(txn_id, AbortReason::Requested)
    }

    fn abort_with(&self, txn_id: TxnId, reason: AbortReason) -> TxnResult<()> {
        let keys = {
            let txns = self.txns.read();
            let mut txn = txns
                .get(&txn_id)
                .ok_or(TxnError::NotFound(txn_id))?
                .lock();
            match txn.state {
                TransactionState::Active
                | TransactionState::Preparing
                | TransactionState::Prepared => {}
                TransactionState::Aborted => return Ok(()),
                TransactionState::Committed => {
                    return Err(self.state_error(txn_id, &txn, "Active, Preparing or Prepared"));
                }
            }
            txn.state = TransactionState::Aborted;
            txn.abort_reason = Some(reason);
            txn.write_keys()
        };

        self.store.finalize_abort(txn_id, &keys);
        self.locks.release_all(txn_id);

        self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
        match reason {
            AbortReason::Conflict => {
                self.stats.conflicts.fetch_add(1, AtomicOrdering::Relaxed);
            }
            AbortReason::Deadlock => {
                self.stats.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
            }
            AbortReason::Timeout => {
                self.stats
                    .lock_timeouts
                    .fetch_add(1, AtomicOrdering::Relaxed);
            }
            _ => {}
        }
        debug!(txn = txn_id.as_u64(), %reason, "abort");
        Ok(())
    }

    /// Returns Prepared transactions older than `age`, for monitoring.
    ///
    /// A long-Prepared transaction is in doubt and pins both its locks
    /// and GC; an operator (or the coordinator's recovery path) has to
    /// resolve it.
    pub fn prepared_older_than(&self, age: Duration) -> Vec<TxnId> {
        let txns = self.txns.read();
        let mut stuck: Vec<TxnId> = txns
            .iter()
            .filter_map(|(&id, cell)| {
                let txn = cell.lock();
                match (txn.state, txn.prepared_at) {
                    (TransactionState::Prepared, Some(at)) if at.elapsed() >= age => Some(id),
                    _ => None,
                }
            })
            .collect();
        stuck.sort();
        stuck
    }

    /// Drops bookkeeping for terminal transactions. Returns the number
    /// removed.
    pub fn reap_finished(&self) -> usize {
        let mut txns = self.txns.write();
        let before = txns.len();
        txns.retain(|_, cell| !cell.lock().state.is_terminal());
        before - txns.len()
    }

    /// Short-lock check that the transaction exists and is Active.
    fn check_active(&self, txn_id: TxnId) -> TxnResult<(Snapshot, IsolationLevel)> {
        let txns = self.txns.read();
        let txn = txns
            .get(&txn_id)
            .ok_or(TxnError::NotFound(txn_id))?
            .lock();
        if txn.state != TransactionState::Active {
            return Err(self.state_error(txn_id, &txn, "Active"));
        }
        Ok((txn.snapshot, txn.isolation))
    }

    fn recheck_active(&self, txn_id: TxnId) -> TxnResult<()> {
        match self.check_active(txn_id) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.locks.release_all(txn_id);
                Err(err)
            }
        }
    }

    /// Blocking lock acquire; a failure aborts the transaction.
    fn lock_or_abort(&self, txn_id: TxnId, key: &RowKey, mode: LockMode) -> TxnResult<()> {
        match self
            .locks
            .acquire(txn_id, key, mode, Some(self.config.lock_timeout))
        {
            Ok(()) => Ok(()),
            Err(err) => {
                let reason = match err {
                    LockError::Timeout { .. } => AbortReason::Timeout,
                    LockError::DeadlockVictim { .. } => AbortReason::Deadlock,
                };
                self.abort_with(txn_id, reason)?;
                Err(TxnError::Aborted { txn_id, reason })
            }
        }
    }

    fn state_error(&self, txn_id: TxnId, txn: &Transaction, expected: &'static str) -> TxnError {
        if txn.state == TransactionState::Aborted {
            if let Some(reason) = txn.abort_reason {
                return TxnError::Aborted { txn_id, reason };
            }
        }
        TxnError::InvalidState {
            txn_id,
            state: txn.state,
            expected,
        }
    }
}

impl OldestSnapshot for TransactionManager {
    /// The GC boundary: the minimum snapshot any non-terminal transaction
    /// holds.
    fn oldest_active_snapshot(&self) -> Option<CommitTs> {
        let txns = self.txns.read();
        txns.values()
            .filter_map(|cell| {
                let txn = cell.lock();
                if txn.state.is_terminal() {
                    None
                } else {
                    Some(txn.snapshot.read_ts())
                }
            })
            .min()
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactions", &self.txns.read().len())
            .finish()
    }
}
