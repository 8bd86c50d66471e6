//! Garbage collection of dead versions.
//!
//! A version becomes garbage once it has been superseded and the
//! superseding commit is older than every active transaction's snapshot.
//! The collector asks an [`OldestSnapshot`] provider (normally the
//! transaction manager) for that boundary each pass, so it can never
//! collect a version some snapshot still needs.
//!
//! Collection runs either on demand ([`GarbageCollector::run_once`]) or
//! from a background thread at a fixed interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ember_common::types::CommitTs;
use tracing::debug;

use crate::version::VersionStore;

/// Supplies the oldest snapshot any active transaction holds.
///
/// `None` means no transaction is active, so every superseded version is
/// reclaimable.
pub trait OldestSnapshot: Send + Sync {
    /// Returns the minimum `read_ts` across active transactions.
    fn oldest_active_snapshot(&self) -> Option<CommitTs>;
}

/// Configuration for the garbage collector.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// How often the background thread runs a pass.
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

/// Counters for GC activity.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Passes completed.
    pub passes: AtomicU64,
    /// Versions reclaimed.
    pub collected: AtomicU64,
    /// Empty chains pruned.
    pub chains_pruned: AtomicU64,
}

/// Collects versions no active snapshot can see.
pub struct GarbageCollector {
    store: Arc<VersionStore>,
    provider: Arc<dyn OldestSnapshot>,
    config: GcConfig,
    stats: Arc<GcStats>,
}

impl GarbageCollector {
    /// Creates a collector over `store`, consulting `provider` each pass.
    pub fn new(store: Arc<VersionStore>, provider: Arc<dyn OldestSnapshot>) -> Self {
        Self::with_config(store, provider, GcConfig::default())
    }

    /// Creates a collector with custom configuration.
    pub fn with_config(
        store: Arc<VersionStore>,
        provider: Arc<dyn OldestSnapshot>,
        config: GcConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            stats: Arc::new(GcStats::default()),
        }
    }

    /// Runs one collection pass. Returns the number of versions reclaimed.
    pub fn run_once(&self) -> usize {
        // With no active transaction nothing is pinned.
        let oldest = self
            .provider
            .oldest_active_snapshot()
            .unwrap_or(CommitTs::MAX);

        let collected = self.store.garbage_collect(oldest);
        let pruned = self.store.prune_empty_chains();

        self.stats.passes.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats
            .collected
            .fetch_add(collected as u64, AtomicOrdering::Relaxed);
        self.stats
            .chains_pruned
            .fetch_add(pruned as u64, AtomicOrdering::Relaxed);

        if collected > 0 {
            debug!(oldest = %oldest, collected, pruned, "gc pass");
        }
        collected
    }

    /// Returns GC statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Spawns a background thread running passes at the configured
    /// interval until the returned handle is stopped or dropped.
    pub fn spawn(self) -> GcHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let interval = self.config.interval;
        let stats = Arc::clone(&self.stats);

        let handle = std::thread::spawn(move || {
            while !thread_stop.load(AtomicOrdering::Acquire) {
                self.run_once();
                std::thread::sleep(interval);
            }
        });

        GcHandle {
            stop,
            handle: Some(handle),
            stats,
        }
    }
}

/// Handle to a running background collector; stops it on drop.
pub struct GcHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<GcStats>,
}

impl GcHandle {
    /// Signals the collector thread to stop and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Returns GC statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    fn shutdown(&mut self) {
        self.stop.store(true, AtomicOrdering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use bytes::Bytes;
    use ember_common::types::{RowKey, TxnId};
    use parking_lot::Mutex;

    struct FixedOldest(Mutex<Option<CommitTs>>);

    impl OldestSnapshot for FixedOldest {
        fn oldest_active_snapshot(&self) -> Option<CommitTs> {
            *self.0.lock()
        }
    }

    fn store_with_history() -> Arc<VersionStore> {
        let store = Arc::new(VersionStore::new());
        let k = RowKey::from_str("x");
        store
            .stage_write(
                &Snapshot::new(TxnId::new(1), CommitTs::ZERO),
                &k,
                Bytes::from("v1"),
            )
            .unwrap();
        store.finalize_commit(TxnId::new(1), &[k.clone()], CommitTs::new(1));
        store
            .stage_write(
                &Snapshot::new(TxnId::new(2), CommitTs::new(1)),
                &k,
                Bytes::from("v2"),
            )
            .unwrap();
        store.finalize_commit(TxnId::new(2), &[k], CommitTs::new(2));
        store
    }

    #[test]
    fn test_run_once_pinned_by_old_snapshot() {
        let store = store_with_history();
        let provider = Arc::new(FixedOldest(Mutex::new(Some(CommitTs::new(1)))));
        let gc = GarbageCollector::new(Arc::clone(&store), provider.clone());

        // A transaction at snapshot 1 still needs v1.
        assert_eq!(gc.run_once(), 0);

        // Once the oldest snapshot advances past the supersede, v1 goes.
        *provider.0.lock() = Some(CommitTs::new(3));
        assert_eq!(gc.run_once(), 1);
        assert_eq!(gc.stats().passes.load(AtomicOrdering::Relaxed), 2);
        assert_eq!(gc.stats().collected.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_run_once_no_active_txns() {
        let store = store_with_history();
        let provider = Arc::new(FixedOldest(Mutex::new(None)));
        let gc = GarbageCollector::new(store, provider);

        // No active transactions: the superseded version is reclaimable.
        assert_eq!(gc.run_once(), 1);
    }

    #[test]
    fn test_background_thread_collects() {
        let store = store_with_history();
        let provider = Arc::new(FixedOldest(Mutex::new(None)));
        let gc = GarbageCollector::with_config(
            Arc::clone(&store),
            provider,
            GcConfig {
                interval: Duration::from_millis(1),
            },
        );

        let handle = gc.spawn();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.stats().collected.load(AtomicOrdering::Relaxed) == 0 {
            assert!(std::time::Instant::now() < deadline, "gc never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop();

        assert_eq!(store.get_chain(&RowKey::from_str("x")).unwrap().len(), 1);
    }
}
