use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::common::TxnId;

use super::lock_manager::LockManager;
use super::transaction::{IsolationLevel, Transaction, TransactionState};

/// Hands out transaction ids and finishes transactions, releasing their
/// locks through the shared [`LockManager`].
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    lock_manager: Arc<LockManager>,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(0),
            lock_manager,
            txn_map: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a transaction in the growing phase. Later transactions get
    /// larger ids, so a larger id means younger.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.txn_map.lock().insert(txn_id, Arc::clone(&txn));
        debug!(txn = %txn_id, ?isolation_level, "transaction started");
        txn
    }

    /// Releases every lock and marks the transaction committed. Returns
    /// false, changing nothing, if it already aborted or committed.
    pub fn commit(&self, txn: &Arc<Transaction>) -> bool {
        if txn.state().is_terminal() {
            return false;
        }
        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Committed);
        self.txn_map.lock().remove(&txn.id());
        debug!(txn = %txn.id(), "transaction committed");
        true
    }

    /// Marks the transaction aborted, pulls it out of any lock wait and
    /// releases every lock it holds. Safe to call on a transaction the lock
    /// manager already aborted.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.abort_waiting(txn);
        self.lock_manager.release_all(txn);
        self.txn_map.lock().remove(&txn.id());
        debug!(txn = %txn.id(), "transaction aborted");
    }

    /// A transaction that has begun but not yet finished.
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().get(&txn_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.txn_map.lock().len()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }
}
