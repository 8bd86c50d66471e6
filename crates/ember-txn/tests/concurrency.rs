//! Concurrency-control integration tests.
//!
//! These drive the full stack: transaction manager over the version
//! store and lock manager, with the deadlock detector and garbage
//! collector running where the scenario needs them.

use std::sync::Arc;

use bytes::Bytes;
use ember_common::types::{CommitTs, RowKey};
use ember_mvcc::gc::{GarbageCollector, OldestSnapshot};
use ember_mvcc::version::VersionStore;
use ember_txn::deadlock::DeadlockDetector;
use ember_txn::lock::LockManager;
use ember_txn::manager::{AbortReason, TransactionManager, TransactionState, TxnError};

struct Stack {
    store: Arc<VersionStore>,
    locks: Arc<LockManager>,
    manager: Arc<TransactionManager>,
}

fn stack() -> Stack {
    let store = Arc::new(VersionStore::new());
    let locks = Arc::new(LockManager::new());
    let manager = Arc::new(TransactionManager::new(
        Arc::clone(&store),
        Arc::clone(&locks),
    ));
    Stack {
        store,
        locks,
        manager,
    }
}

#[test]
fn test_snapshot_boundaries_around_commit() {
    let s = stack();
    let x = RowKey::from_str("x");

    // Four filler commits push the clock to 4.
    for i in 0..4 {
        let t = s.manager.begin();
        s.manager
            .write(t, &RowKey::from_str(&format!("filler:{i}")), Bytes::from("f"))
            .unwrap();
        s.manager.commit(t).unwrap();
    }

    let a = s.manager.begin();
    s.manager.write(a, &x, Bytes::from("1")).unwrap();

    // B begins before A commits: snapshot 4.
    let b = s.manager.begin();
    assert_eq!(s.manager.snapshot(b).unwrap().read_ts(), CommitTs::new(4));

    assert_eq!(s.manager.commit(a).unwrap(), CommitTs::new(5));

    // C begins after: snapshot 5.
    let c = s.manager.begin();
    assert_eq!(s.manager.snapshot(c).unwrap().read_ts(), CommitTs::new(5));

    // B sees the pre-A state of x, C sees A's write.
    assert_eq!(s.manager.read(b, &x).unwrap(), None);
    assert_eq!(s.manager.read(c, &x).unwrap(), Some(Bytes::from("1")));
}

#[test]
fn test_deadlock_cycle_aborts_exactly_one() {
    let s = stack();
    let detector = DeadlockDetector::new(Arc::clone(&s.locks)).spawn();

    let x = RowKey::from_str("x");
    let y = RowKey::from_str("y");
    let a = s.manager.begin();
    let b = s.manager.begin();
    s.manager.write(a, &x, Bytes::from("ax")).unwrap();
    s.manager.write(b, &y, Bytes::from("by")).unwrap();

    let (ma, yb) = (Arc::clone(&s.manager), y.clone());
    let wa = std::thread::spawn(move || ma.write(a, &yb, Bytes::from("ay")));
    let (mb, xb) = (Arc::clone(&s.manager), x.clone());
    let wb = std::thread::spawn(move || mb.write(b, &xb, Bytes::from("bx")));

    let ra = wa.join().unwrap();
    let rb = wb.join().unwrap();

    // Exactly one of the two was chosen as victim.
    let aborted = [&ra, &rb]
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(TxnError::Aborted {
                    reason: AbortReason::Deadlock,
                    ..
                })
            )
        })
        .count();
    assert_eq!(aborted, 1);

    // The survivor commits; the victim's writes are all gone.
    let (survivor, victim) = if ra.is_ok() { (a, b) } else { (b, a) };
    s.manager.commit(survivor).unwrap();
    assert_eq!(
        s.manager.state(victim).unwrap(),
        TransactionState::Aborted
    );

    let check = s.manager.begin();
    let vx = s.manager.read(check, &x).unwrap().unwrap();
    let vy = s.manager.read(check, &y).unwrap().unwrap();
    // Both keys hold the survivor's values.
    let expect = if survivor == a { ("ax", "ay") } else { ("bx", "by") };
    assert_eq!(vx, Bytes::from(expect.0));
    assert_eq!(vy, Bytes::from(expect.1));

    detector.stop();
}

#[test]
fn test_gc_driven_by_transaction_manager() {
    let s = stack();
    let gc = GarbageCollector::new(
        Arc::clone(&s.store),
        Arc::clone(&s.manager) as Arc<dyn OldestSnapshot>,
    );
    let k = RowKey::from_str("k");

    // Two generations of the same key: v1 at ts=1, superseded at ts=2.
    for value in ["v1", "v2"] {
        let t = s.manager.begin();
        s.manager.write(t, &k, Bytes::from(value)).unwrap();
        s.manager.commit(t).unwrap();
    }

    // A reader at snapshot 2 could still be shown v1 by a snapshot at
    // ts=1, but its own snapshot is the oldest, and the supersede at
    // ts=2 is not older than it. v1 stays.
    let reader = s.manager.begin();
    assert_eq!(gc.run_once(), 0);

    // Once the reader finishes no snapshot is active; v1 goes.
    s.manager.commit(reader).unwrap();
    assert_eq!(gc.run_once(), 1);

    // A reader begun before the next write pins v2 afterwards.
    let pin = s.manager.begin();
    let t = s.manager.begin();
    s.manager.write(t, &k, Bytes::from("v3")).unwrap();
    s.manager.commit(t).unwrap();
    assert_eq!(gc.run_once(), 0);
    assert_eq!(s.manager.read(pin, &k).unwrap(), Some(Bytes::from("v2")));

    // Pin released; the next pass reclaims v2.
    s.manager.commit(pin).unwrap();
    assert_eq!(gc.run_once(), 1);

    let check = s.manager.begin();
    assert_eq!(s.manager.read(check, &k).unwrap(), Some(Bytes::from("v3")));
}

#[test]
fn test_many_transactions_disjoint_keys_commit_concurrently() {
    let s = stack();
    let threads = 8;
    let per_thread = 20;

    let mut handles = Vec::new();
    for t in 0..threads {
        let manager = Arc::clone(&s.manager);
        handles.push(std::thread::spawn(move || {
            for i in 0..per_thread {
                let key = RowKey::from_str(&format!("t{t}:k{i}"));
                let txn = manager.begin();
                manager.write(txn, &key, Bytes::from(format!("{t}:{i}"))).unwrap();
                manager.commit(txn).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Commit timestamps were unique and every write is readable.
    let check = s.manager.begin();
    assert_eq!(
        s.manager.snapshot(check).unwrap().read_ts(),
        CommitTs::new((threads * per_thread) as u64)
    );
    for t in 0..threads {
        for i in 0..per_thread {
            let key = RowKey::from_str(&format!("t{t}:k{i}"));
            assert_eq!(
                s.manager.read(check, &key).unwrap(),
                Some(Bytes::from(format!("{t}:{i}")))
            );
        }
    }
}
