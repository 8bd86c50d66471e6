//! Wait-for-graph deadlock detection.
//!
//! Each pass rebuilds the wait-for graph from the lock table's wait
//! queues rather than maintaining it incrementally, so the graph can
//! never drift out of sync with the locks that actually exist. The graph
//! is small (bounded by waiting transactions), which keeps the rebuild
//! cheap.
//!
//! When a cycle is found, the youngest transaction in it (highest id,
//! which ordered id allocation makes the most recently started) is marked
//! as a victim on the lock manager. The victim's pending `acquire` call
//! observes the mark and returns [`LockError::DeadlockVictim`], and its
//! abort breaks the cycle.
//!
//! [`LockError::DeadlockVictim`]: crate::lock::LockError::DeadlockVictim

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ember_common::types::TxnId;
use tracing::warn;

use crate::lock::LockManager;

/// A wait-for graph over transactions.
///
/// An edge `A -> B` means transaction A is waiting for a lock B holds
/// (or for B's earlier position in a wait queue).
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: HashMap<TxnId, HashSet<TxnId>>,
}

impl WaitForGraph {
    /// Builds a graph from `(waiter, holder)` edge pairs.
    pub fn from_edges(pairs: &[(TxnId, TxnId)]) -> Self {
        let mut edges: HashMap<TxnId, HashSet<TxnId>> = HashMap::new();
        for &(waiter, holder) in pairs {
            if waiter != holder {
                edges.entry(waiter).or_default().insert(holder);
            }
        }
        Self { edges }
    }

    /// Returns the number of waiting transactions.
    pub fn node_count(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if the graph has no edges.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Removes a transaction and all its edges.
    pub fn remove(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for targets in self.edges.values_mut() {
            targets.remove(&txn_id);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
    }

    /// Finds one cycle, if any, returned as the list of transactions on
    /// it. Uses iterative DFS with a three-color marking.
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<TxnId, Color> =
            self.edges.keys().map(|&n| (n, Color::White)).collect();
        for targets in self.edges.values() {
            for &t in targets {
                color.entry(t).or_insert(Color::White);
            }
        }

        let roots: Vec<TxnId> = {
            let mut r: Vec<TxnId> = self.edges.keys().copied().collect();
            r.sort();
            r
        };

        for root in roots {
            if color[&root] != Color::White {
                continue;
            }
            // Stack of (node, next-neighbor-index); `path` mirrors it.
            let mut stack: Vec<(TxnId, Vec<TxnId>, usize)> = Vec::new();
            let mut path: Vec<TxnId> = Vec::new();

            color.insert(root, Color::Gray);
            stack.push((root, self.sorted_neighbors(root), 0));
            path.push(root);

            while let Some((node, neighbors, idx)) = stack.last_mut() {
                if *idx < neighbors.len() {
                    let next = neighbors[*idx];
                    *idx += 1;
                    match color.get(&next).copied().unwrap_or(Color::White) {
                        Color::Gray => {
                            // Back edge: the cycle is the path suffix
                            // starting at `next`.
                            let start = path
                                .iter()
                                .position(|&n| n == next)
                                .unwrap_or(0);
                            return Some(path[start..].to_vec());
                        }
                        Color::White => {
                            color.insert(next, Color::Gray);
                            let n = self.sorted_neighbors(next);
                            stack.push((next, n, 0));
                            path.push(next);
                        }
                        Color::Black => {}
                    }
                } else {
                    color.insert(*node, Color::Black);
                    stack.pop();
                    path.pop();
                }
            }
        }
        None
    }

    fn sorted_neighbors(&self, node: TxnId) -> Vec<TxnId> {
        let mut n: Vec<TxnId> = self
            .edges
            .get(&node)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        n.sort();
        n
    }
}

/// Counters for detector activity.
#[derive(Debug, Default)]
pub struct DeadlockStats {
    /// Detection passes completed.
    pub passes: AtomicU64,
    /// Cycles found.
    pub deadlocks_found: AtomicU64,
    /// Transactions marked as victims.
    pub victims_chosen: AtomicU64,
}

/// Periodic deadlock detector over a [`LockManager`].
pub struct DeadlockDetector {
    locks: Arc<LockManager>,
    stats: Arc<DeadlockStats>,
}

impl DeadlockDetector {
    /// Creates a detector over the given lock manager.
    pub fn new(locks: Arc<LockManager>) -> Self {
        Self {
            locks,
            stats: Arc::new(DeadlockStats::default()),
        }
    }

    /// Runs one detection pass: rebuilds the wait-for graph, breaks every
    /// cycle found by marking its youngest transaction as a victim.
    /// Returns the victims chosen this pass.
    pub fn run_once(&self) -> Vec<TxnId> {
        let mut graph = WaitForGraph::from_edges(&self.locks.wait_edges());
        let mut victims = Vec::new();

        // Several independent cycles can exist at once; resolve all of
        // them in the same pass.
        while let Some(cycle) = graph.find_cycle() {
            self.stats
                .deadlocks_found
                .fetch_add(1, AtomicOrdering::Relaxed);

            if let Some(&victim) = cycle.iter().max() {
                warn!(
                    victim = victim.as_u64(),
                    cycle_len = cycle.len(),
                    "deadlock detected, aborting youngest transaction"
                );
                self.locks.mark_victim(victim);
                graph.remove(victim);
                victims.push(victim);
                self.stats
                    .victims_chosen
                    .fetch_add(1, AtomicOrdering::Relaxed);
            } else {
                break;
            }
        }

        self.stats.passes.fetch_add(1, AtomicOrdering::Relaxed);
        victims
    }

    /// Returns detector statistics.
    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }

    /// Spawns a background thread running passes at the lock manager's
    /// configured detection interval until the returned handle is
    /// stopped or dropped.
    pub fn spawn(self) -> DetectorHandle {
        let interval = self.locks.config().detect_interval;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let stats = Arc::clone(&self.stats);

        let handle = std::thread::spawn(move || {
            while !thread_stop.load(AtomicOrdering::Acquire) {
                self.run_once();
                std::thread::sleep(interval);
            }
        });

        DetectorHandle {
            stop,
            handle: Some(handle),
            stats,
        }
    }
}

/// Handle to a running background detector; stops it on drop.
pub struct DetectorHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<DeadlockStats>,
}

impl DetectorHandle {
    /// Signals the detector thread to stop and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Returns detector statistics.
    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }

    fn shutdown(&mut self) {
        self.stop.store(true, AtomicOrdering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockError, LockMode};
    use ember_common::types::RowKey;
    use std::time::Duration;

    fn t(n: u64) -> TxnId {
        TxnId::new(n)
    }

    #[test]
    fn test_empty_graph_no_cycle() {
        let graph = WaitForGraph::from_edges(&[]);
        assert!(graph.find_cycle().is_none());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_chain_no_cycle() {
        let graph = WaitForGraph::from_edges(&[(t(1), t(2)), (t(2), t(3)), (t(3), t(4))]);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_two_cycle() {
        let graph = WaitForGraph::from_edges(&[(t(1), t(2)), (t(2), t(1))]);
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.len(), 2);
        assert!(cycle.contains(&t(1)));
        assert!(cycle.contains(&t(2)));
    }

    #[test]
    fn test_three_cycle_with_tail() {
        let graph = WaitForGraph::from_edges(&[
            (t(5), t(1)),
            (t(1), t(2)),
            (t(2), t(3)),
            (t(3), t(1)),
        ]);
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.len(), 3);
        assert!(!cycle.contains(&t(5)));
    }

    #[test]
    fn test_remove_breaks_cycle() {
        let mut graph =
            WaitForGraph::from_edges(&[(t(1), t(2)), (t(2), t(3)), (t(3), t(1))]);
        assert!(graph.find_cycle().is_some());
        graph.remove(t(3));
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_self_edge_ignored() {
        let graph = WaitForGraph::from_edges(&[(t(1), t(1))]);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_detector_picks_youngest() {
        let lm = Arc::new(LockManager::new());
        let a = RowKey::from_str("a");
        let b = RowKey::from_str("b");
        let long = Some(Duration::from_secs(10));

        // Txn 1 holds a, txn 2 holds b.
        lm.acquire(t(1), &a, LockMode::Exclusive, long).unwrap();
        lm.acquire(t(2), &b, LockMode::Exclusive, long).unwrap();

        // Cross-wait on background threads.
        let lm1 = Arc::clone(&lm);
        let b1 = b.clone();
        let w1 = std::thread::spawn(move || lm1.acquire(t(1), &b1, LockMode::Exclusive, long));
        let lm2 = Arc::clone(&lm);
        let a2 = a.clone();
        let w2 = std::thread::spawn(move || lm2.acquire(t(2), &a2, LockMode::Exclusive, long));

        // Wait until both edges are visible, then detect.
        let detector = DeadlockDetector::new(Arc::clone(&lm));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let victims = loop {
            let victims = detector.run_once();
            if !victims.is_empty() {
                break victims;
            }
            assert!(std::time::Instant::now() < deadline, "no deadlock found");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(victims, vec![t(2)]);

        // Txn 2's wait fails as victim; it aborts, releasing b.
        let err = w2.join().unwrap().unwrap_err();
        assert!(matches!(err, LockError::DeadlockVictim { txn_id } if txn_id == t(2)));
        lm.release_all(t(2));

        // Txn 1's wait now succeeds.
        w1.join().unwrap().unwrap();
        assert_eq!(
            detector.stats().victims_chosen.load(AtomicOrdering::Relaxed),
            1
        );
    }

    #[test]
    fn test_background_detector_resolves_cycle() {
        let lm = Arc::new(LockManager::new());
        let a = RowKey::from_str("a");
        let b = RowKey::from_str("b");
        let long = Some(Duration::from_secs(10));

        lm.acquire(t(1), &a, LockMode::Exclusive, long).unwrap();
        lm.acquire(t(2), &b, LockMode::Exclusive, long).unwrap();

        let handle = DeadlockDetector::new(Arc::clone(&lm)).spawn();

        let lm1 = Arc::clone(&lm);
        let b1 = b.clone();
        let w1 = std::thread::spawn(move || lm1.acquire(t(1), &b1, LockMode::Exclusive, long));
        let lm2 = Arc::clone(&lm);
        let a2 = a.clone();
        let w2 = std::thread::spawn(move || lm2.acquire(t(2), &a2, LockMode::Exclusive, long));

        let r2 = w2.join().unwrap();
        assert!(matches!(r2, Err(LockError::DeadlockVictim { .. })));
        lm.release_all(t(2));
        w1.join().unwrap().unwrap();

        handle.stop();
    }
}
