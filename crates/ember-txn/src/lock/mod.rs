//! Row-level lock management.
//!
//! Shared (S) and Exclusive (X) locks per row key, with strict two-phase
//! locking: a transaction's locks are released only at commit or abort.
//!
//! # Compatibility Matrix
//!
//! ```text
//!      │ S │ X │
//! ─────┼───┼───┤
//!   S  │ ✓ │ ✗ │
//!   X  │ ✗ │ ✗ │
//! ```
//!
//! # Fairness
//!
//! Lock requests queue in arrival order. A request is granted only when it
//! is compatible with the current holders *and* every earlier waiter has
//! been granted or cancelled, so a queued Exclusive request is never
//! starved by a stream of later Shared requests. On release, waiters wake
//! in order and the maximal compatible prefix of the queue is granted.
//!
//! # Blocking
//!
//! [`LockManager::acquire`] suspends only the calling transaction's
//! thread: it polls with a short sleep, checking for grant, timeout, and
//! deadlock-victim marks left by the detector.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use ember_common::types::{RowKey, TxnId};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

/// How long the acquire loop sleeps between polls.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Lock mode for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared (read) lock.
    Shared,
    /// Exclusive (write) lock.
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Returns true if this mode covers a request for `other`.
    pub fn covers(self, other: LockMode) -> bool {
        self == LockMode::Exclusive || other == LockMode::Shared
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// Errors returned by [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The wait timed out; only the wait request was cancelled.
    #[error("lock wait on {key:?} timed out for txn {txn_id}")]
    Timeout {
        /// The contended key.
        key: RowKey,
        /// The waiting transaction.
        txn_id: TxnId,
    },
    /// The deadlock detector chose this transaction as a victim; it must
    /// abort.
    #[error("txn {txn_id} chosen as deadlock victim")]
    DeadlockVictim {
        /// The victim transaction.
        txn_id: TxnId,
    },
}

/// A queued lock request.
#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

/// Lock state for one row key.
#[derive(Debug, Default)]
struct LockEntry {
    /// Current holders and the mode each holds.
    holders: HashMap<TxnId, LockMode>,
    /// Waiting requests in arrival order.
    wait_queue: VecDeque<LockRequest>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.holders.is_empty() && self.wait_queue.is_empty()
    }

    /// A request is compatible when every *other* holder tolerates it.
    fn compatible(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .all(|(&holder, &held)| holder == txn_id || mode.is_compatible_with(held))
    }

    /// Grants the maximal compatible prefix of the wait queue.
    fn grant_waiters(&mut self, granted: &mut Vec<TxnId>) {
        while let Some(front) = self.wait_queue.front() {
            if self.compatible(front.txn_id, front.mode) {
                let req = match self.wait_queue.pop_front() {
                    Some(r) => r,
                    None => break,
                };
                self.holders.insert(req.txn_id, req.mode);
                granted.push(req.txn_id);
            } else {
                break;
            }
        }
    }
}

/// Configuration for the lock manager.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Timeout applied when `acquire` is called without one.
    pub default_timeout: Duration,
    /// Interval at which the deadlock detector runs.
    pub detect_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            detect_interval: Duration::from_millis(50),
        }
    }
}

/// Counters for lock activity.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Locks granted.
    pub acquisitions: AtomicU64,
    /// Locks released.
    pub releases: AtomicU64,
    /// Requests that had to wait.
    pub waits: AtomicU64,
    /// Waits ending in timeout.
    pub timeouts: AtomicU64,
    /// Waits ending as deadlock victim.
    pub victims: AtomicU64,
    /// Shared-to-exclusive upgrades.
    pub upgrades: AtomicU64,
}

/// The row-level lock manager.
pub struct LockManager {
    /// Lock table, keyed by row.
    locks: RwLock<HashMap<RowKey, LockEntry>>,
    /// Keys locked per transaction, for `release_all`.
    txn_locks: RwLock<HashMap<TxnId, HashSet<RowKey>>>,
    /// Transactions marked for abort by the deadlock detector.
    victims: Mutex<HashSet<TxnId>>,
    config: LockManagerConfig,
    stats: LockStats,
}

impl LockManager {
    /// Creates a lock manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    /// Creates a lock manager with custom configuration.
    pub fn with_config(config: LockManagerConfig) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            txn_locks: RwLock::new(HashMap::new()),
            victims: Mutex::new(HashSet::new()),
            config,
            stats: LockStats::default(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Acquires a lock, blocking the calling thread until it is granted,
    /// `timeout` elapses, or the deadlock detector picks this transaction
    /// as a victim.
    pub fn acquire(
        &self,
        txn_id: TxnId,
        key: &RowKey,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;

        if self.try_acquire(txn_id, key, mode) {
            self.stats.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(());
        }
        self.stats.waits.fetch_add(1, AtomicOrdering::Relaxed);

        loop {
            // Victim marks take priority over a racing grant: the
            // transaction must abort either way, and release_all will
            // clean up anything granted in between.
            if self.take_victim_mark(txn_id) {
                self.cancel_wait(txn_id, key, mode);
                self.stats.victims.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(LockError::DeadlockVictim { txn_id });
            }

            if self.holds(txn_id, key, mode) {
                self.stats.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
                return Ok(());
            }

            if Instant::now() >= deadline {
                // Re-check under the table lock: the grant may have raced
                // with the deadline.
                if self.cancel_wait(txn_id, key, mode) {
                    self.stats.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
                    return Err(LockError::Timeout {
                        key: key.clone(),
                        txn_id,
                    });
                }
                self.stats.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
                return Ok(());
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Tries to grant immediately; enqueues a wait request otherwise.
    /// Returns true on immediate grant.
    fn try_acquire(&self, txn_id: TxnId, key: &RowKey, mode: LockMode) -> bool {
        let mut locks = self.locks.write();
        let entry = locks.entry(key.clone()).or_default();

        // Re-entrant: already holding a covering mode.
        if let Some(&held) = entry.holders.get(&txn_id) {
            if held.covers(mode) {
                return true;
            }
            // Upgrade S -> X, allowed when sole holder.
            if entry.holders.len() == 1 {
                entry.holders.insert(txn_id, LockMode::Exclusive);
                self.stats.upgrades.fetch_add(1, AtomicOrdering::Relaxed);
                self.track(txn_id, key);
                return true;
            }
        } else if entry.wait_queue.is_empty() && entry.compatible(txn_id, mode) {
            // Fairness: never jump over queued waiters.
            entry.holders.insert(txn_id, mode);
            self.track(txn_id, key);
            return true;
        }

        // Avoid duplicate queue entries across poll restarts.
        if !entry
            .wait_queue
            .iter()
            .any(|r| r.txn_id == txn_id && r.mode == mode)
        {
            entry.wait_queue.push_back(LockRequest { txn_id, mode });
        }
        false
    }

    fn track(&self, txn_id: TxnId, key: &RowKey) {
        self.txn_locks
            .write()
            .entry(txn_id)
            .or_default()
            .insert(key.clone());
    }

    /// Checks whether `txn_id` holds `key` in a mode covering `mode`.
    fn holds(&self, txn_id: TxnId, key: &RowKey, mode: LockMode) -> bool {
        let locks = self.locks.read();
        locks
            .get(key)
            .and_then(|e| e.holders.get(&txn_id))
            .is_some_and(|held| held.covers(mode))
    }

    /// Returns the mode `txn_id` holds on `key`, if any.
    pub fn held_mode(&self, txn_id: TxnId, key: &RowKey) -> Option<LockMode> {
        self.locks.read().get(key)?.holders.get(&txn_id).copied()
    }

    /// Removes `txn_id`'s queued request for `key`. Returns true if a
    /// request was actually waiting (false means a grant covering `mode`
    /// raced ahead of the cancellation).
    fn cancel_wait(&self, txn_id: TxnId, key: &RowKey, mode: LockMode) -> bool {
        let mut locks = self.locks.write();
        let Some(entry) = locks.get_mut(key) else {
            return false;
        };
        // An upgrade waiter still holds its old mode; only a covering
        // grant counts as granted.
        if entry
            .holders
            .get(&txn_id)
            .is_some_and(|held| held.covers(mode))
        {
            entry.wait_queue.retain(|r| r.txn_id != txn_id);
            return false;
        }
        let before = entry.wait_queue.len();
        entry.wait_queue.retain(|r| r.txn_id != txn_id);
        let removed = entry.wait_queue.len() < before;

        // The cancelled waiter may have been the one blocking the front.
        let mut granted = Vec::new();
        entry.grant_waiters(&mut granted);
        if entry.is_free() {
            locks.remove(key);
        }
        drop(locks);
        for txn in granted {
            self.track(txn, key);
        }
        removed
    }

    /// Releases every lock held by `txn_id` and wakes queued waiters in
    /// order, granting the maximal compatible set. Returns the number of
    /// locks released.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let keys: Vec<RowKey> = self
            .txn_locks
            .write()
            .remove(&txn_id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();

        let mut released = 0;
        for key in &keys {
            let mut granted = Vec::new();
            {
                let mut locks = self.locks.write();
                if let Some(entry) = locks.get_mut(key) {
                    if entry.holders.remove(&txn_id).is_some() {
                        released += 1;
                        self.stats.releases.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    entry.wait_queue.retain(|r| r.txn_id != txn_id);
                    entry.grant_waiters(&mut granted);
                    if entry.is_free() {
                        locks.remove(key);
                    }
                }
            }
            for txn in granted {
                self.track(txn, key);
            }
        }

        self.victims.lock().remove(&txn_id);
        released
    }

    /// Marks a transaction as a deadlock victim; its pending or next
    /// `acquire` returns [`LockError::DeadlockVictim`].
    pub fn mark_victim(&self, txn_id: TxnId) {
        self.victims.lock().insert(txn_id);
    }

    fn take_victim_mark(&self, txn_id: TxnId) -> bool {
        self.victims.lock().remove(&txn_id)
    }

    /// Snapshot of wait-for edges derived from the wait queues.
    ///
    /// Each waiter waits for the current holders of its key and for every
    /// earlier incompatible waiter (fairness queues behind them too). One
    /// table read guard makes the snapshot globally consistent.
    pub fn wait_edges(&self) -> Vec<(TxnId, TxnId)> {
        let locks = self.locks.read();
        let mut edges = Vec::new();
        for entry in locks.values() {
            for (pos, req) in entry.wait_queue.iter().enumerate() {
                for (&holder, _) in entry.holders.iter() {
                    if holder != req.txn_id {
                        edges.push((req.txn_id, holder));
                    }
                }
                for earlier in entry.wait_queue.iter().take(pos) {
                    if earlier.txn_id != req.txn_id
                        && !(req.mode.is_compatible_with(earlier.mode))
                    {
                        edges.push((req.txn_id, earlier.txn_id));
                    }
                }
            }
        }
        edges
    }

    /// Returns the number of keys with lock state.
    pub fn lock_count(&self) -> usize {
        self.locks.read().len()
    }

    /// Returns the number of transactions holding locks.
    pub fn txn_count(&self) -> usize {
        self.txn_locks.read().len()
    }

    /// Returns lock statistics.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_count", &self.lock_count())
            .field("txn_count", &self.txn_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(s: &str) -> RowKey {
        RowKey::from_str(s)
    }

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    #[test]
    fn test_mode_compatibility() {
        assert!(LockMode::Shared.is_compatible_with(LockMode::Shared));
        assert!(!LockMode::Shared.is_compatible_with(LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible_with(LockMode::Shared));
        assert!(!LockMode::Exclusive.is_compatible_with(LockMode::Exclusive));
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let k = key("a");
        lm.acquire(TxnId::new(1), &k, LockMode::Shared, SHORT).unwrap();
        lm.acquire(TxnId::new(2), &k, LockMode::Shared, SHORT).unwrap();
        assert_eq!(lm.held_mode(TxnId::new(1), &k), Some(LockMode::Shared));
        assert_eq!(lm.held_mode(TxnId::new(2), &k), Some(LockMode::Shared));
    }

    #[test]
    fn test_exclusive_blocks_until_timeout() {
        let lm = LockManager::new();
        let k = key("a");
        lm.acquire(TxnId::new(1), &k, LockMode::Exclusive, SHORT)
            .unwrap();

        let err = lm
            .acquire(TxnId::new(2), &k, LockMode::Shared, SHORT)
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        // The wait request was cancelled, nothing else.
        assert_eq!(lm.held_mode(TxnId::new(1), &k), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let lm = Arc::new(LockManager::new());
        let k = key("a");
        lm.acquire(TxnId::new(1), &k, LockMode::Exclusive, SHORT)
            .unwrap();

        let lm2 = Arc::clone(&lm);
        let k2 = k.clone();
        let waiter = std::thread::spawn(move || {
            lm2.acquire(
                TxnId::new(2),
                &k2,
                LockMode::Exclusive,
                Some(Duration::from_secs(5)),
            )
        });

        std::thread::sleep(Duration::from_millis(20));
        lm.release_all(TxnId::new(1));

        waiter.join().unwrap().unwrap();
        assert_eq!(lm.held_mode(TxnId::new(2), &k), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_queued_exclusive_blocks_later_shared() {
        let lm = LockManager::new();
        let k = key("a");
        // Txn 1 holds S; txn 2 queues X; txn 3's S must not jump ahead.
        lm.acquire(TxnId::new(1), &k, LockMode::Shared, SHORT).unwrap();
        assert!(!lm.try_acquire(TxnId::new(2), &k, LockMode::Exclusive));

        let err = lm
            .acquire(TxnId::new(3), &k, LockMode::Shared, SHORT)
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn test_fifo_grant_on_release() {
        let lm = Arc::new(LockManager::new());
        let k = key("a");
        lm.acquire(TxnId::new(1), &k, LockMode::Exclusive, SHORT)
            .unwrap();

        // Queue: X(2) then S(3). After release, 2 must win first.
        assert!(!lm.try_acquire(TxnId::new(2), &k, LockMode::Exclusive));
        assert!(!lm.try_acquire(TxnId::new(3), &k, LockMode::Shared));

        lm.release_all(TxnId::new(1));
        assert_eq!(lm.held_mode(TxnId::new(2), &k), Some(LockMode::Exclusive));
        assert_eq!(lm.held_mode(TxnId::new(3), &k), None);

        lm.release_all(TxnId::new(2));
        // Now txn 3's queued request gets granted.
        assert_eq!(lm.held_mode(TxnId::new(3), &k), Some(LockMode::Shared));
    }

    #[test]
    fn test_upgrade_sole_holder() {
        let lm = LockManager::new();
        let k = key("a");
        lm.acquire(TxnId::new(1), &k, LockMode::Shared, SHORT).unwrap();
        lm.acquire(TxnId::new(1), &k, LockMode::Exclusive, SHORT)
            .unwrap();
        assert_eq!(lm.held_mode(TxnId::new(1), &k), Some(LockMode::Exclusive));
        assert_eq!(lm.stats().upgrades.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_reentrant_acquire() {
        let lm = LockManager::new();
        let k = key("a");
        lm.acquire(TxnId::new(1), &k, LockMode::Exclusive, SHORT)
            .unwrap();
        // Holding X covers a later S request.
        lm.acquire(TxnId::new(1), &k, LockMode::Shared, SHORT).unwrap();
        assert_eq!(lm.held_mode(TxnId::new(1), &k), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_victim_mark_aborts_wait() {
        let lm = Arc::new(LockManager::new());
        let k = key("a");
        lm.acquire(TxnId::new(1), &k, LockMode::Exclusive, SHORT)
            .unwrap();

        let lm2 = Arc::clone(&lm);
        let k2 = k.clone();
        let waiter = std::thread::spawn(move || {
            lm2.acquire(
                TxnId::new(2),
                &k2,
                LockMode::Exclusive,
                Some(Duration::from_secs(5)),
            )
        });

        std::thread::sleep(Duration::from_millis(20));
        lm.mark_victim(TxnId::new(2));

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, LockError::DeadlockVictim { .. }));
    }

    #[test]
    fn test_release_all_clears_everything() {
        let lm = LockManager::new();
        lm.acquire(TxnId::new(1), &key("a"), LockMode::Shared, SHORT)
            .unwrap();
        lm.acquire(TxnId::new(1), &key("b"), LockMode::Exclusive, SHORT)
            .unwrap();

        assert_eq!(lm.release_all(TxnId::new(1)), 2);
        assert_eq!(lm.lock_count(), 0);
        assert_eq!(lm.txn_count(), 0);
    }

    #[test]
    fn test_wait_edges_derived_from_queues() {
        let lm = LockManager::new();
        let k = key("a");
        lm.acquire(TxnId::new(1), &k, LockMode::Exclusive, SHORT)
            .unwrap();
        assert!(!lm.try_acquire(TxnId::new(2), &k, LockMode::Exclusive));
        assert!(!lm.try_acquire(TxnId::new(3), &k, LockMode::Exclusive));

        let edges = lm.wait_edges();
        assert!(edges.contains(&(TxnId::new(2), TxnId::new(1))));
        assert!(edges.contains(&(TxnId::new(3), TxnId::new(1))));
        // Txn 3 also queues behind txn 2.
        assert!(edges.contains(&(TxnId::new(3), TxnId::new(2))));
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lm = Arc::new(LockManager::new());
        let k = key("hot");
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let mut handles = Vec::new();
        for txn in 1..=8u64 {
            let lm = Arc::clone(&lm);
            let k = k.clone();
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                lm.acquire(
                    TxnId::new(txn),
                    &k,
                    LockMode::Exclusive,
                    Some(Duration::from_secs(10)),
                )
                .unwrap();
                // At most one thread in here at a time.
                let inside = counter.fetch_add(1, AtomicOrdering::SeqCst);
                assert_eq!(inside, 0);
                std::thread::sleep(Duration::from_millis(2));
                counter.fetch_sub(1, AtomicOrdering::SeqCst);
                lm.release_all(TxnId::new(txn));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
