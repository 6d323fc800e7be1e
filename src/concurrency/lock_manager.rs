//! Table and row locks under two-phase locking.
//!
//! Each lockable resource has a request queue guarded by its own mutex and
//! condition variable. The maps from resource to queue are only locked long
//! enough to find or create a queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::common::{AbortReason, RecordId, Result, StrataError, TableOid, TxnId};

use super::transaction::{IsolationLevel, Transaction, TransactionState};
use super::wait_for_graph::WaitForGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    Shared,
    IntentionExclusive,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Whether a lock in `self` can be granted while `other` is held.
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Upgrades allowed in place: S -> SIX/X, IX -> SIX/X, SIX -> X.
    pub fn can_upgrade_to(self, to: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, to),
            (Shared, SharedIntentionExclusive)
                | (Shared, Exclusive)
                | (IntentionExclusive, SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }

    pub fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        )
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::IntentionShared => "IS",
            LockMode::Shared => "S",
            LockMode::IntentionExclusive => "IX",
            LockMode::SharedIntentionExclusive => "SIX",
            LockMode::Exclusive => "X",
        };
        f.write_str(s)
    }
}

/// What a queue protects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Table(TableOid),
    Row(TableOid, RecordId),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Table(oid) => write!(f, "table {}", oid),
            Resource::Row(oid, rid) => write!(f, "row {} of table {}", rid, oid),
        }
    }
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
    deadlock_victim: bool,
}

impl LockRequest {
    fn new(txn: &Arc<Transaction>, mode: LockMode) -> Self {
        Self {
            txn: Arc::clone(txn),
            mode,
            granted: false,
            deadlock_victim: false,
        }
    }
}

#[derive(Default)]
struct QueueState {
    requests: Vec<LockRequest>,
    upgrading: Option<TxnId>,
}

impl QueueState {
    fn position(&self, txn_id: TxnId) -> Option<usize> {
        self.requests.iter().position(|r| r.txn.id() == txn_id)
    }

    /// Compatible with every granted request, and either the in-flight
    /// upgrade or compatible with every waiter queued ahead of it.
    fn grantable(&self, txn_id: TxnId, mode: LockMode) -> bool {
        if self
            .requests
            .iter()
            .any(|r| r.granted && !r.mode.is_compatible_with(mode))
        {
            return false;
        }
        if let Some(upgrading) = self.upgrading {
            return upgrading == txn_id;
        }
        self.requests
            .iter()
            .take_while(|r| r.txn.id() != txn_id)
            .filter(|r| !r.granted)
            .all(|r| r.mode.is_compatible_with(mode))
    }
}

#[derive(Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        Arc::clone(self.table_lock_map.lock().entry(oid).or_default())
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        Arc::clone(self.row_lock_map.lock().entry(rid).or_default())
    }

    /// Sets `txn` to aborted and builds the error to hand back.
    fn abort(&self, txn: &Transaction, reason: AbortReason) -> StrataError {
        txn.set_state(TransactionState::Aborted);
        warn!(txn = %txn.id(), %reason, "aborting transaction");
        StrataError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    /// Rejects modes the isolation level forbids in the current state.
    fn check_isolation(&self, txn: &Transaction, mode: LockMode) -> Result<()> {
        let shrinking = txn.state() == TransactionState::Shrinking;
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(
                    mode,
                    LockMode::Shared | LockMode::IntentionShared | LockMode::SharedIntentionExclusive
                ) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if shrinking && !matches!(mode, LockMode::IntentionShared | LockMode::Shared) {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Acquires `mode` on `oid`, blocking until it can be granted.
    ///
    /// Returns `Ok(false)` if the transaction already finished, and aborts it
    /// with an error when the request breaks 2PL or isolation rules.
    pub fn lock_table(&self, txn: &Arc<Transaction>, mode: LockMode, oid: TableOid) -> Result<bool> {
        if txn.state().is_terminal() {
            return Ok(false);
        }
        self.check_isolation(txn, mode)?;
        let queue = self.table_queue(oid);
        self.acquire(txn, &queue, mode, Resource::Table(oid))?;
        Ok(true)
    }

    /// Releases the table lock. All row locks under the table must be
    /// released first.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<bool> {
        if txn.state().is_terminal() {
            return Ok(false);
        }
        if txn.row_lock_count(oid) > 0 {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }
        let Some(mode) = txn.table_lock_mode(oid) else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if !self.release(&self.table_queue(oid), txn.id()) {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        }
        txn.set_table_lock(oid, None);
        self.maybe_shrink(txn, mode);
        trace!(txn = %txn.id(), %mode, table = oid, "released table lock");
        Ok(true)
    }

    /// Acquires `mode` on a row. Only S and X are allowed, and the
    /// transaction must already hold a suitable lock on the table. The
    /// table lock is checked before the isolation rules.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> Result<bool> {
        if txn.state().is_terminal() {
            return Ok(false);
        }
        if mode.is_intention() {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }

        let table_mode = txn.table_lock_mode(oid);
        let table_ok = match mode {
            LockMode::Exclusive => matches!(
                table_mode,
                Some(LockMode::IntentionExclusive)
                    | Some(LockMode::SharedIntentionExclusive)
                    | Some(LockMode::Exclusive)
            ),
            _ => table_mode.is_some(),
        };
        if !table_ok {
            return Err(self.abort(txn, AbortReason::TableLockNotPresent));
        }
        self.check_isolation(txn, mode)?;

        let queue = self.row_queue(rid);
        self.acquire(txn, &queue, mode, Resource::Row(oid, rid))?;
        Ok(true)
    }

    pub fn unlock_row(&self, txn: &Arc<Transaction>, oid: TableOid, rid: RecordId) -> Result<bool> {
        if txn.state().is_terminal() {
            return Ok(false);
        }
        let Some(mode) = txn.row_lock_mode(oid, rid) else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if !self.release(&self.row_queue(rid), txn.id()) {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        }
        txn.set_row_lock(oid, rid, None);
        self.maybe_shrink(txn, mode);
        trace!(txn = %txn.id(), %mode, %rid, "released row lock");
        Ok(true)
    }

    /// Drops every lock `txn` holds, rows before tables, without touching
    /// its 2PL state. Used at commit and abort.
    pub(crate) fn release_all(&self, txn: &Transaction) {
        for (oid, rid) in txn.held_row_locks() {
            self.release(&self.row_queue(rid), txn.id());
            txn.set_row_lock(oid, rid, None);
        }
        for (oid, _) in txn.held_table_locks() {
            self.release(&self.table_queue(oid), txn.id());
            txn.set_table_lock(oid, None);
        }
    }

    fn maybe_shrink(&self, txn: &Transaction, released: LockMode) {
        let shrinks = match released {
            LockMode::Exclusive => true,
            LockMode::Shared => txn.isolation_level() == IsolationLevel::RepeatableRead,
            _ => false,
        };
        if shrinks && txn.begin_shrinking() {
            debug!(txn = %txn.id(), "transaction entered shrinking phase");
        }
    }

    /// Queues the request (or turns the held lock into an upgrade request)
    /// and waits until it is granted or the transaction is aborted. A grant
    /// is recorded in the transaction's lock set before returning.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        queue: &LockRequestQueue,
        mode: LockMode,
        resource: Resource,
    ) -> Result<()> {
        let txn_id = txn.id();
        let mut state = queue.state.lock();

        match state.position(txn_id) {
            Some(pos) => {
                let held = state.requests[pos].mode;
                if held == mode {
                    return Ok(());
                }
                if state.upgrading.is_some() {
                    return Err(self.abort(txn, AbortReason::UpgradeConflict));
                }
                if !held.can_upgrade_to(mode) {
                    return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
                }
                state.requests.remove(pos);
                match resource {
                    Resource::Table(oid) => txn.set_table_lock(oid, None),
                    Resource::Row(oid, rid) => txn.set_row_lock(oid, rid, None),
                }
                // Upgrades go ahead of every waiter
                let first_waiter = state
                    .requests
                    .iter()
                    .position(|r| !r.granted)
                    .unwrap_or(state.requests.len());
                state.requests.insert(first_waiter, LockRequest::new(txn, mode));
                state.upgrading = Some(txn_id);
                trace!(txn = %txn_id, from = %held, to = %mode, %resource, "upgrading lock");
            }
            None => state.requests.push(LockRequest::new(txn, mode)),
        }

        loop {
            if txn.state() == TransactionState::Aborted {
                let reason = match state.position(txn_id) {
                    Some(pos) if state.requests[pos].deadlock_victim => AbortReason::Deadlock,
                    _ => AbortReason::AbortedWhileWaiting,
                };
                state.requests.retain(|r| r.txn.id() != txn_id);
                if state.upgrading == Some(txn_id) {
                    state.upgrading = None;
                }
                queue.cv.notify_all();
                warn!(txn = %txn_id, %resource, %reason, "lock wait abandoned by aborted transaction");
                return Err(StrataError::TransactionAbort { txn_id, reason });
            }
            if state.grantable(txn_id, mode) {
                break;
            }
            queue.cv.wait(&mut state);
        }

        if let Some(pos) = state.position(txn_id) {
            state.requests[pos].granted = true;
        }
        // Recorded under the queue latch so a concurrent abort sees it
        match resource {
            Resource::Table(oid) => txn.set_table_lock(oid, Some(mode)),
            Resource::Row(oid, rid) => txn.set_row_lock(oid, rid, Some(mode)),
        }
        if state.upgrading == Some(txn_id) {
            state.upgrading = None;
        }
        debug!(txn = %txn_id, %mode, %resource, "lock granted");
        Ok(())
    }

    /// Removes the granted request of `txn_id` and wakes the waiters.
    fn release(&self, queue: &LockRequestQueue, txn_id: TxnId) -> bool {
        let mut state = queue.state.lock();
        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn.id() == txn_id && r.granted)
        else {
            return false;
        };
        state.requests.remove(pos);
        queue.cv.notify_all();
        true
    }

    /// Wakes every queue `txn` is waiting in so the waiter sees its
    /// aborted state and leaves the queue. The caller sets the state first.
    pub(crate) fn abort_waiting(&self, txn: &Transaction) {
        let txn_id = txn.id();
        for queue in self.all_queues() {
            let state = queue.state.lock();
            if state.requests.iter().any(|r| !r.granted && r.txn.id() == txn_id) {
                trace!(txn = %txn_id, "waking aborted waiter");
                queue.cv.notify_all();
            }
        }
    }

    fn all_queues(&self) -> Vec<Arc<LockRequestQueue>> {
        let mut queues: Vec<_> = self.table_lock_map.lock().values().cloned().collect();
        queues.extend(self.row_lock_map.lock().values().cloned());
        queues
    }

    /// Snapshot of who waits for whom.
    ///
    /// A waiter points at every granted holder it conflicts with, every
    /// conflicting waiter queued ahead of it, and the in-flight upgrader.
    pub fn build_wait_for_graph(&self) -> WaitForGraph {
        let mut graph = WaitForGraph::new();
        for queue in self.all_queues() {
            let state = queue.state.lock();
            for (i, waiter) in state.requests.iter().enumerate().filter(|(_, r)| !r.granted) {
                let waiter_id = waiter.txn.id();
                for (j, other) in state.requests.iter().enumerate() {
                    let other_id = other.txn.id();
                    if other_id == waiter_id {
                        continue;
                    }
                    let conflicts = !other.mode.is_compatible_with(waiter.mode);
                    let blocks = (other.granted && conflicts)
                        || (!other.granted && j < i && conflicts)
                        || state.upgrading == Some(other_id);
                    if blocks {
                        graph.add_edge(waiter_id, other_id);
                    }
                }
            }
        }
        graph
    }

    /// One detection pass: breaks every cycle by aborting its youngest
    /// member and waking it. Returns the victims.
    pub fn run_cycle_detection_once(&self) -> Vec<TxnId> {
        let mut graph = self.build_wait_for_graph();
        let mut victims = Vec::new();
        while let Some(victim) = graph.has_cycle() {
            graph.remove_node(victim);
            victims.push(victim);
        }
        if victims.is_empty() {
            return victims;
        }

        for queue in self.all_queues() {
            let mut state = queue.state.lock();
            let mut woke = false;
            for request in state.requests.iter_mut().filter(|r| !r.granted) {
                if victims.contains(&request.txn.id()) {
                    request.deadlock_victim = true;
                    request.txn.set_state(TransactionState::Aborted);
                    woke = true;
                }
            }
            if woke {
                queue.cv.notify_all();
            }
        }
        for victim in &victims {
            warn!(txn = %victim, "deadlock detected, aborting youngest transaction");
        }
        victims
    }

    /// Runs [`run_cycle_detection_once`](Self::run_cycle_detection_once)
    /// every `interval` on a background thread until the returned handle
    /// is dropped.
    pub fn start_deadlock_detection(self: &Arc<Self>, interval: Duration) -> Result<DeadlockDetector> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let lock_manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("strata-deadlock".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        lock_manager.run_cycle_detection_once();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        debug!(?interval, "deadlock detector started");
        Ok(DeadlockDetector {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }
}

/// Handle to the background detector thread. Dropping it stops the thread.
pub struct DeadlockDetector {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread immediately
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("deadlock detector thread panicked");
            }
        }
    }
}
