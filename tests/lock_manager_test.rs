//! Integration tests for two-phase locking and deadlock detection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use strata::common::{AbortReason, PageId, RecordId, SlotId, TxnId};
use strata::concurrency::{
    IsolationLevel, LockManager, LockMode, Transaction, TransactionManager, TransactionState,
};

const TABLE: u32 = 1;

fn setup() -> (Arc<LockManager>, TransactionManager) {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = TransactionManager::new(Arc::clone(&lock_manager));
    (lock_manager, txn_manager)
}

fn rid(n: u32) -> RecordId {
    RecordId::new(PageId::new(n), SlotId::new(0))
}

/// Polls until `cond` holds, failing the test after a few seconds.
fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached");
}

#[test]
fn test_shared_row_locks_are_compatible() {
    let (lm, tm) = setup();
    let t0 = tm.begin(IsolationLevel::RepeatableRead);
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    for txn in [&t0, &t1] {
        assert!(lm.lock_table(txn, LockMode::IntentionShared, TABLE).unwrap());
        assert!(lm.lock_row(txn, LockMode::Shared, TABLE, rid(1)).unwrap());
        assert_eq!(txn.row_lock_mode(TABLE, rid(1)), Some(LockMode::Shared));
    }
    assert!(lm.build_wait_for_graph().is_empty());

    assert!(tm.commit(&t0));
    assert!(tm.commit(&t1));
    assert_eq!(t0.row_lock_count(TABLE), 0);
    assert_eq!(t0.table_lock_mode(TABLE), None);
}

#[test]
fn test_repeated_request_is_a_no_op() {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::ReadCommitted);

    assert!(lm.lock_table(&txn, LockMode::IntentionExclusive, TABLE).unwrap());
    assert!(lm.lock_table(&txn, LockMode::IntentionExclusive, TABLE).unwrap());
    assert_eq!(txn.table_lock_set(LockMode::IntentionExclusive).len(), 1);
    assert!(lm.unlock_table(&txn, TABLE).unwrap());
}

#[test]
fn test_upgrade_in_place() {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&txn, LockMode::IntentionShared, TABLE).unwrap();
    lm.lock_table(&txn, LockMode::IntentionExclusive, TABLE).unwrap();
    assert_eq!(txn.table_lock_mode(TABLE), Some(LockMode::IntentionExclusive));

    lm.lock_row(&txn, LockMode::Shared, TABLE, rid(3)).unwrap();
    lm.lock_row(&txn, LockMode::Exclusive, TABLE, rid(3)).unwrap();
    assert_eq!(txn.row_lock_mode(TABLE, rid(3)), Some(LockMode::Exclusive));
    assert_eq!(txn.row_lock_count(TABLE), 1);

    // X cannot go back to S
    let err = lm.lock_row(&txn, LockMode::Shared, TABLE, rid(3)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::IncompatibleUpgrade));
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_exclusive_waits_for_shared_release() {
    let (lm, tm) = setup();
    let reader = tm.begin(IsolationLevel::RepeatableRead);
    let writer = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&reader, LockMode::IntentionShared, TABLE).unwrap();
    lm.lock_row(&reader, LockMode::Shared, TABLE, rid(1)).unwrap();
    lm.lock_table(&writer, LockMode::IntentionExclusive, TABLE).unwrap();

    let granted = Arc::new(AtomicBool::new(false));
    let handle = {
        let lm = Arc::clone(&lm);
        let writer = Arc::clone(&writer);
        let granted = Arc::clone(&granted);
        thread::spawn(move || {
            let result = lm.lock_row(&writer, LockMode::Exclusive, TABLE, rid(1));
            granted.store(true, Ordering::SeqCst);
            result
        })
    };

    wait_until(|| !lm.build_wait_for_graph().is_empty());
    assert_eq!(
        lm.build_wait_for_graph().edge_list(),
        vec![(writer.id(), reader.id())]
    );
    assert!(!granted.load(Ordering::SeqCst));

    lm.unlock_row(&reader, TABLE, rid(1)).unwrap();
    assert!(handle.join().unwrap().unwrap());
    assert_eq!(writer.row_lock_mode(TABLE, rid(1)), Some(LockMode::Exclusive));
    assert_eq!(reader.state(), TransactionState::Shrinking);
}

#[test]
fn test_waiters_are_granted_in_order() {
    let (lm, tm) = setup();
    let holder = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&holder, LockMode::Exclusive, TABLE).unwrap();

    let grants = Arc::new(Mutex::new(Vec::new()));
    let waiters: Vec<_> = (0..3).map(|_| tm.begin(IsolationLevel::RepeatableRead)).collect();
    let mut handles = Vec::new();
    for (i, txn) in waiters.iter().enumerate() {
        let worker_lm = Arc::clone(&lm);
        let txn = Arc::clone(txn);
        let grants = Arc::clone(&grants);
        handles.push(thread::spawn(move || {
            worker_lm.lock_table(&txn, LockMode::Exclusive, TABLE).unwrap();
            grants.lock().push(txn.id());
            worker_lm.unlock_table(&txn, TABLE).unwrap();
        }));
        // Waiter i points at the holder and every waiter ahead of it
        let expected_edges = (i + 1) * (i + 2) / 2;
        wait_until(|| lm.build_wait_for_graph().edge_list().len() == expected_edges);
    }

    lm.unlock_table(&holder, TABLE).unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    let expected: Vec<TxnId> = waiters.iter().map(|t| t.id()).collect();
    assert_eq!(*grants.lock(), expected);
}

#[test]
fn test_isolation_level_rules() {
    let (lm, tm) = setup();

    let ru = tm.begin(IsolationLevel::ReadUncommitted);
    lm.lock_table(&ru, LockMode::IntentionExclusive, TABLE).unwrap();
    let err = lm.lock_row(&ru, LockMode::Shared, TABLE, rid(1)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::LockSharedOnReadUncommitted));
    assert_eq!(ru.state(), TransactionState::Aborted);

    // Requests from a finished transaction are refused quietly
    assert!(!lm.lock_table(&ru, LockMode::IntentionExclusive, 2).unwrap());
    tm.abort(&ru);

    let rc = tm.begin(IsolationLevel::ReadCommitted);
    lm.lock_table(&rc, LockMode::IntentionExclusive, TABLE).unwrap();
    lm.lock_row(&rc, LockMode::Exclusive, TABLE, rid(2)).unwrap();
    lm.unlock_row(&rc, TABLE, rid(2)).unwrap();
    assert_eq!(rc.state(), TransactionState::Shrinking);
    // Shared locks are still allowed while shrinking under READ_COMMITTED
    assert!(lm.lock_row(&rc, LockMode::Shared, TABLE, rid(3)).unwrap());
    let err = lm.lock_row(&rc, LockMode::Exclusive, TABLE, rid(4)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::LockOnShrinking));
    tm.abort(&rc);

    let rr = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&rr, LockMode::Shared, TABLE).unwrap();
    lm.unlock_table(&rr, TABLE).unwrap();
    assert_eq!(rr.state(), TransactionState::Shrinking);
    let err = lm.lock_table(&rr, LockMode::IntentionShared, TABLE).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::LockOnShrinking));
}

#[test]
fn test_row_lock_rules() {
    let (lm, tm) = setup();

    let no_table = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm.lock_row(&no_table, LockMode::Shared, TABLE, rid(1)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::TableLockNotPresent));

    // The missing table lock is reported ahead of the isolation rule
    let uncommitted = tm.begin(IsolationLevel::ReadUncommitted);
    let err = lm.lock_row(&uncommitted, LockMode::Shared, TABLE, rid(1)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::TableLockNotPresent));

    let weak_table = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&weak_table, LockMode::IntentionShared, TABLE).unwrap();
    let err = lm.lock_row(&weak_table, LockMode::Exclusive, TABLE, rid(1)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::TableLockNotPresent));

    let intention = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&intention, LockMode::IntentionExclusive, TABLE).unwrap();
    let err = lm
        .lock_row(&intention, LockMode::IntentionExclusive, TABLE, rid(1))
        .unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::AttemptedIntentionLockOnRow));
}

#[test]
fn test_unlock_rules() {
    let (lm, tm) = setup();

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&txn, LockMode::IntentionExclusive, TABLE).unwrap();
    lm.lock_row(&txn, LockMode::Exclusive, TABLE, rid(1)).unwrap();
    let err = lm.unlock_table(&txn, TABLE).unwrap_err();
    assert_eq!(
        err.abort_reason(),
        Some(AbortReason::TableUnlockedBeforeUnlockingRows)
    );
    tm.abort(&txn);
    assert_eq!(txn.row_lock_count(TABLE), 0);

    let idle = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm.unlock_row(&idle, TABLE, rid(1)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::AttemptedUnlockButNoLockHeld));

    let idle = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm.unlock_table(&idle, TABLE).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::AttemptedUnlockButNoLockHeld));

    // Releasing intention locks never starts shrinking
    let txn = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&txn, LockMode::IntentionShared, TABLE).unwrap();
    lm.unlock_table(&txn, TABLE).unwrap();
    assert_eq!(txn.state(), TransactionState::Growing);
}

#[test]
fn test_concurrent_upgrades_conflict() {
    let (lm, tm) = setup();
    let t0 = tm.begin(IsolationLevel::RepeatableRead);
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&t0, LockMode::Shared, TABLE).unwrap();
    lm.lock_table(&t1, LockMode::Shared, TABLE).unwrap();

    let handle = {
        let lm = Arc::clone(&lm);
        let t0 = Arc::clone(&t0);
        thread::spawn(move || lm.lock_table(&t0, LockMode::Exclusive, TABLE))
    };
    wait_until(|| !lm.build_wait_for_graph().is_empty());

    let err = lm.lock_table(&t1, LockMode::Exclusive, TABLE).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::UpgradeConflict));
    tm.abort(&t1);

    assert!(handle.join().unwrap().unwrap());
    assert_eq!(t0.table_lock_mode(TABLE), Some(LockMode::Exclusive));
}

#[test]
fn test_abort_wakes_waiting_transaction() {
    let (lm, tm) = setup();
    let holder = tm.begin(IsolationLevel::RepeatableRead);
    let blocked = tm.begin(IsolationLevel::RepeatableRead);
    let behind = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&holder, LockMode::Shared, TABLE).unwrap();

    let spawn_lock = |txn: &Arc<Transaction>, mode: LockMode| {
        let lm = Arc::clone(&lm);
        let txn = Arc::clone(txn);
        thread::spawn(move || lm.lock_table(&txn, mode, TABLE))
    };
    let blocked_wait = spawn_lock(&blocked, LockMode::Exclusive);
    wait_until(|| lm.build_wait_for_graph().edge_list().len() == 1);
    // S is compatible with the holder but queues behind the X waiter
    let behind_wait = spawn_lock(&behind, LockMode::Shared);
    wait_until(|| lm.build_wait_for_graph().edge_list().len() == 2);

    tm.abort(&blocked);
    let err = blocked_wait.join().unwrap().unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::AbortedWhileWaiting));
    assert_eq!(blocked.table_lock_mode(TABLE), None);

    assert!(behind_wait.join().unwrap().unwrap());
    assert_eq!(behind.table_lock_mode(TABLE), Some(LockMode::Shared));
    assert!(lm.build_wait_for_graph().is_empty());
    assert_eq!(tm.active_count(), 2);
}

#[test]
fn test_deadlock_aborts_youngest() {
    let (lm, tm) = setup();
    let older = tm.begin(IsolationLevel::RepeatableRead);
    let younger = tm.begin(IsolationLevel::RepeatableRead);

    for (txn, row) in [(&older, rid(1)), (&younger, rid(2))] {
        lm.lock_table(txn, LockMode::IntentionExclusive, TABLE).unwrap();
        lm.lock_row(txn, LockMode::Exclusive, TABLE, row).unwrap();
    }

    let spawn_wait = |txn: &Arc<Transaction>, row: RecordId| {
        let lm = Arc::clone(&lm);
        let txn = Arc::clone(txn);
        thread::spawn(move || lm.lock_row(&txn, LockMode::Exclusive, TABLE, row))
    };
    let older_wait = spawn_wait(&older, rid(2));
    let younger_wait = spawn_wait(&younger, rid(1));

    wait_until(|| lm.build_wait_for_graph().edge_list().len() == 2);
    assert_eq!(lm.build_wait_for_graph().has_cycle(), Some(younger.id()));

    assert_eq!(lm.run_cycle_detection_once(), vec![younger.id()]);
    let err = younger_wait.join().unwrap().unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::Deadlock));
    assert_eq!(younger.state(), TransactionState::Aborted);

    // The victim's locks go away with the abort, unblocking the survivor
    tm.abort(&younger);
    assert!(older_wait.join().unwrap().unwrap());
    assert_eq!(older.row_lock_count(TABLE), 2);
    assert!(tm.commit(&older));
}

#[test]
fn test_background_detector_breaks_deadlock() {
    let (lm, tm) = setup();
    let tm = Arc::new(tm);
    let detector = lm.start_deadlock_detection(Duration::from_millis(20)).unwrap();

    let a = tm.begin(IsolationLevel::RepeatableRead);
    let b = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&a, LockMode::Shared, 10).unwrap();
    lm.lock_table(&b, LockMode::Shared, 20).unwrap();

    let worker = |txn: Arc<Transaction>, oid: u32| {
        let lm = Arc::clone(&lm);
        let tm = Arc::clone(&tm);
        thread::spawn(move || match lm.lock_table(&txn, LockMode::Exclusive, oid) {
            Ok(granted) => {
                assert!(granted);
                tm.commit(&txn);
                true
            }
            Err(_) => {
                tm.abort(&txn);
                false
            }
        })
    };
    let a_wait = worker(Arc::clone(&a), 20);
    let b_wait = worker(Arc::clone(&b), 10);

    assert!(a_wait.join().unwrap());
    assert!(!b_wait.join().unwrap());
    assert_eq!(a.state(), TransactionState::Committed);
    assert_eq!(b.state(), TransactionState::Aborted);
    assert_eq!(tm.active_count(), 0);

    drop(detector);
}
